//! Listening socket setup and per-connection socket tuning.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::config::SessionConfig;

/// Bind a non-blocking listener with `SO_REUSEADDR` on the first address
/// `addr` resolves to that accepts the bind.
pub fn bind(addr: &str, backlog: u32) -> io::Result<TcpListener> {
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no socket addresses found",
        ));
    }

    let mut last_err = None;
    for addr in addrs {
        match bind_one(addr, backlog) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                tracing::debug!("Bind to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::other("failed to bind any address")))
}

fn bind_one(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    // Lets a restarted listener rebind while old connections sit in TIME_WAIT.
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Apply keep-alive, buffer sizes and `TCP_NODELAY` to a new connection.
///
/// Failures are logged and otherwise ignored.
pub fn tune(stream: &TcpStream, config: &SessionConfig) {
    let socket = SockRef::from(stream);

    if config.keepalive {
        if let Err(e) = socket.set_keepalive(true) {
            tracing::warn!("Failed to enable SO_KEEPALIVE: {}", e);
        }
    }
    if config.so_sndbuf_size > 0 {
        if let Err(e) = socket.set_send_buffer_size(config.so_sndbuf_size) {
            tracing::warn!("Failed to set SO_SNDBUF to {}: {}", config.so_sndbuf_size, e);
        }
    }
    if config.so_rcvbuf_size > 0 {
        if let Err(e) = socket.set_recv_buffer_size(config.so_rcvbuf_size) {
            tracing::warn!("Failed to set SO_RCVBUF to {}: {}", config.so_rcvbuf_size, e);
        }
    }
    if let Err(e) = stream.set_nodelay(config.no_delay) {
        tracing::warn!("Failed to set TCP_NODELAY: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral() {
        let listener = bind("127.0.0.1:0", 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_rebind_after_close() {
        let listener = bind("127.0.0.1:0", 16).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        drop(server);
        drop(client);
        drop(listener);

        let again = bind(&addr.to_string(), 16).unwrap();
        assert_eq!(again.local_addr().unwrap(), addr);
    }

    #[test]
    fn test_bind_bad_address() {
        assert!(bind("not-an-address", 16).is_err());
    }

    #[test]
    fn test_tune_applies_options() {
        let listener = bind("127.0.0.1:0", 16).unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let config = SessionConfig::default().with_socket_buffers(64 * 1024, 64 * 1024);
        tune(&stream, &config);

        assert!(stream.nodelay().unwrap());
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }
}
