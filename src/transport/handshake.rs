//! Optional handshake run before a session starts.
//!
//! Without the `tls` feature the only step is [`Handshake::None`]. With it,
//! sessions can run a rustls server or client handshake; certificate
//! handling stays with the caller's `rustls` configuration.

use tokio::net::TcpStream;

use super::Transport;
use crate::error::Result;

#[cfg(feature = "tls")]
use crate::error::PackwireError;
#[cfg(feature = "tls")]
use std::sync::Arc;
#[cfg(feature = "tls")]
use tokio_rustls::rustls::{self, pki_types::ServerName};

/// Handshake step applied to every new connection.
#[derive(Clone, Default)]
pub enum Handshake {
    /// Plain TCP; the session is started as soon as it is connected.
    #[default]
    None,
    /// Server side TLS.
    #[cfg(feature = "tls")]
    TlsServer(tokio_rustls::TlsAcceptor),
    /// Client side TLS with the name to verify.
    #[cfg(feature = "tls")]
    TlsClient {
        /// Connector built from the client configuration.
        connector: tokio_rustls::TlsConnector,
        /// Server name used for SNI and certificate verification.
        server_name: ServerName<'static>,
    },
}

impl Handshake {
    /// Server side TLS with the given configuration.
    #[cfg(feature = "tls")]
    pub fn tls_server(config: Arc<rustls::ServerConfig>) -> Self {
        Handshake::TlsServer(tokio_rustls::TlsAcceptor::from(config))
    }

    /// Client side TLS verifying `server_name`.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if `server_name` is not a valid DNS name or IP.
    #[cfg(feature = "tls")]
    pub fn tls_client(config: Arc<rustls::ClientConfig>, server_name: &str) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| PackwireError::invalid(format!("server name {server_name:?}: {e}")))?;
        Ok(Handshake::TlsClient {
            connector: tokio_rustls::TlsConnector::from(config),
            server_name,
        })
    }

    /// Whether a handshake step runs at all.
    pub fn is_none(&self) -> bool {
        matches!(self, Handshake::None)
    }

    /// Run the handshake over `stream`.
    ///
    /// # Errors
    ///
    /// `Handshake` when the TLS exchange fails.
    pub async fn establish(&self, stream: TcpStream) -> Result<Transport> {
        match self {
            Handshake::None => Ok(Transport::Plain(stream)),
            #[cfg(feature = "tls")]
            Handshake::TlsServer(acceptor) => acceptor
                .accept(stream)
                .await
                .map(|tls| Transport::Tls(Box::new(tokio_rustls::TlsStream::Server(tls))))
                .map_err(|e| PackwireError::Handshake(e.to_string())),
            #[cfg(feature = "tls")]
            Handshake::TlsClient {
                connector,
                server_name,
            } => connector
                .connect(server_name.clone(), stream)
                .await
                .map(|tls| Transport::Tls(Box::new(tokio_rustls::TlsStream::Client(tls))))
                .map_err(|e| PackwireError::Handshake(e.to_string())),
        }
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handshake::None => f.write_str("Handshake::None"),
            #[cfg(feature = "tls")]
            Handshake::TlsServer(_) => f.write_str("Handshake::TlsServer"),
            #[cfg(feature = "tls")]
            Handshake::TlsClient { server_name, .. } => f
                .debug_struct("Handshake::TlsClient")
                .field("server_name", server_name)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_none_is_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, _) = listener.accept().await.unwrap();
        let _client = connect.await.unwrap();

        let handshake = Handshake::default();
        assert!(handshake.is_none());
        let transport = handshake.establish(stream).await.unwrap();
        assert!(!transport.is_tls());
    }
}
