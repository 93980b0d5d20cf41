//! Listener and connection configuration.
//!
//! A [`SessionConfig`] can be built three ways:
//!
//! - the fluent `with_*` methods starting from [`SessionConfig::new`]
//! - a URL-style string: `tcp://host:port/?recv_buffer_size=1024&silence_timeout=60`
//! - JSON, with every field optional
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use packwire::SessionConfig;
//!
//! let config: SessionConfig = "tcp://127.0.0.1:9000/?silence_timeout=30&recv_buffer_size=4096"
//!     .parse()
//!     .unwrap();
//! assert_eq!(config.port, 9000);
//! assert_eq!(config.recv_buffer_size, 4096);
//! assert_eq!(config.silence_timeout(), Some(Duration::from_secs(30)));
//! ```
//!
//! # URL parameters
//!
//! | Key | Field |
//! |---|---|
//! | `recv_buffer_size` | receive buffer capacity in bytes |
//! | `so_sndbuf_size`, `so_rcvbuf_size` | kernel socket buffer sizes |
//! | `silence_timeout` | idle seconds before the session is closed (0 = never) |
//! | `handshake_timeout` | handshake and forced-close deadline in seconds |
//! | `accept_backoff` | accept retry delay in milliseconds |
//! | `backlog` | listen backlog |
//! | `io_pool_size` | worker threads (0 = automatic) |
//! | `keepalive`, `no_delay` | `true`/`false`/`1`/`0` |

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PackwireError, Result};
use crate::protocol::DEFAULT_RECV_BUFFER_SIZE;

/// Default idle time before a silent session is closed (one hour).
pub const DEFAULT_SILENCE_TIMEOUT_SECS: u64 = 60 * 60;

/// Default handshake and forced-close deadline.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Default delay before retrying a failed accept.
pub const DEFAULT_ACCEPT_BACKOFF_MS: u64 = 100;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Largest accepted `silence_timeout` and `handshake_timeout` (one year).
pub const MAX_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

/// Worker count used by clients when `io_pool_size` is 0.
pub const DEFAULT_CLIENT_POOL_SIZE: usize = 2;

/// Configuration shared by every session of a listener or client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Scheme of the URL form (`tcp`, `tcps`); informational.
    pub scheme: String,
    /// Host to bind (server) or connect to (client).
    pub host: String,
    /// Port to bind or connect to. 0 binds an ephemeral port.
    pub port: u16,
    /// Receive buffer capacity; one frame must fit in it.
    pub recv_buffer_size: usize,
    /// `SO_SNDBUF`; 0 keeps the OS default.
    pub so_sndbuf_size: usize,
    /// `SO_RCVBUF`; 0 keeps the OS default.
    pub so_rcvbuf_size: usize,
    /// Idle seconds before a session is closed; 0 disables the timer.
    pub silence_timeout: u64,
    /// Handshake deadline and forced-close deadline, in seconds.
    pub handshake_timeout: u64,
    /// Accept retry delay, in milliseconds.
    pub accept_backoff: u64,
    /// Listen backlog.
    pub backlog: u32,
    /// Worker threads; 0 picks a default.
    pub io_pool_size: usize,
    /// Enable `SO_KEEPALIVE` on sessions.
    pub keepalive: bool,
    /// Enable `TCP_NODELAY` on sessions.
    pub no_delay: bool,
    /// Panic the session task (debug builds only) on `RecvBufferTooSmall`/`RecvDataInvalid`,
    /// after the session has closed and deregistered.
    pub assert_on_protocol_fault: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scheme: "tcp".to_string(),
            host: "0.0.0.0".to_string(),
            port: 0,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            so_sndbuf_size: 0,
            so_rcvbuf_size: 0,
            silence_timeout: DEFAULT_SILENCE_TIMEOUT_SECS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            accept_backoff: DEFAULT_ACCEPT_BACKOFF_MS,
            backlog: DEFAULT_BACKLOG,
            io_pool_size: 0,
            keepalive: true,
            no_delay: true,
            assert_on_protocol_fault: cfg!(debug_assertions),
        }
    }
}

impl SessionConfig {
    /// Default configuration for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Parse the URL form. See the module docs for the recognized keys.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for a missing port, a non-numeric value or a value
    /// that fails [`validate`](Self::validate). Unknown keys are ignored.
    pub fn from_url(url: &str) -> Result<Self> {
        let mut config = Self::default();

        let rest = match url.split_once("://") {
            Some((scheme, rest)) => {
                if scheme.is_empty() {
                    return Err(PackwireError::invalid(format!("missing scheme in {url:?}")));
                }
                config.scheme = scheme.to_ascii_lowercase();
                rest
            }
            None => url,
        };

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };
        let authority = authority.trim_end_matches('/');
        let (host, port) = split_host_port(authority)?;
        config.host = host;
        config.port = port;

        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| PackwireError::invalid(format!("malformed parameter {pair:?}")))?;
            config.apply(key, value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON object; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PackwireError::invalid(format!("config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values can drive a session.
    pub fn validate(&self) -> Result<()> {
        if self.recv_buffer_size == 0 {
            return Err(PackwireError::invalid("recv_buffer_size must be positive"));
        }
        if self.handshake_timeout == 0 {
            return Err(PackwireError::invalid("handshake_timeout must be positive"));
        }
        if self.handshake_timeout > MAX_TIMEOUT_SECS {
            return Err(PackwireError::invalid(format!(
                "handshake_timeout must not exceed {} seconds",
                MAX_TIMEOUT_SECS
            )));
        }
        if self.silence_timeout > MAX_TIMEOUT_SECS {
            return Err(PackwireError::invalid(format!(
                "silence_timeout must not exceed {} seconds",
                MAX_TIMEOUT_SECS
            )));
        }
        if self.accept_backoff > MAX_TIMEOUT_SECS * 1000 {
            return Err(PackwireError::invalid("accept_backoff is out of range"));
        }
        if self.host.is_empty() {
            return Err(PackwireError::invalid("host must not be empty"));
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "recv_buffer_size" => self.recv_buffer_size = parse_num(key, value)?,
            "so_sndbuf_size" => self.so_sndbuf_size = parse_num(key, value)?,
            "so_rcvbuf_size" => self.so_rcvbuf_size = parse_num(key, value)?,
            "silence_timeout" => self.silence_timeout = parse_num(key, value)?,
            "handshake_timeout" => self.handshake_timeout = parse_num(key, value)?,
            "accept_backoff" => self.accept_backoff = parse_num(key, value)?,
            "backlog" => self.backlog = parse_num(key, value)?,
            "io_pool_size" => self.io_pool_size = parse_num(key, value)?,
            "keepalive" => self.keepalive = parse_bool(key, value)?,
            "no_delay" => self.no_delay = parse_bool(key, value)?,
            _ => tracing::debug!("Ignoring unknown config parameter {}", key),
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Typed accessors
    // ------------------------------------------------------------------------

    /// `host:port` string for binding or connecting.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Silence timeout, `None` when disabled.
    pub fn silence_timeout(&self) -> Option<Duration> {
        (self.silence_timeout > 0).then(|| Duration::from_secs(self.silence_timeout))
    }

    /// Handshake deadline; also bounds the graceful shutdown before a forced close.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Accept retry delay.
    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff)
    }

    /// Effective worker count for a server pool.
    pub fn server_pool_size(&self) -> usize {
        if self.io_pool_size > 0 {
            self.io_pool_size
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(DEFAULT_CLIENT_POOL_SIZE)
        }
    }

    /// Effective worker count for a client pool.
    pub fn client_pool_size(&self) -> usize {
        if self.io_pool_size > 0 {
            self.io_pool_size
        } else {
            DEFAULT_CLIENT_POOL_SIZE
        }
    }

    // ------------------------------------------------------------------------
    // Builder
    // ------------------------------------------------------------------------

    /// Set the receive buffer capacity.
    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Set the kernel send/receive buffer sizes (0 keeps the OS default).
    pub fn with_socket_buffers(mut self, sndbuf: usize, rcvbuf: usize) -> Self {
        self.so_sndbuf_size = sndbuf;
        self.so_rcvbuf_size = rcvbuf;
        self
    }

    /// Set the silence timeout in seconds (0 disables).
    pub fn with_silence_timeout(mut self, secs: u64) -> Self {
        self.silence_timeout = secs;
        self
    }

    /// Set the handshake / forced-close deadline in seconds.
    pub fn with_handshake_timeout(mut self, secs: u64) -> Self {
        self.handshake_timeout = secs;
        self
    }

    /// Set the accept retry delay in milliseconds.
    pub fn with_accept_backoff(mut self, millis: u64) -> Self {
        self.accept_backoff = millis;
        self
    }

    /// Set the listen backlog.
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the worker thread count.
    pub fn with_io_pool_size(mut self, size: usize) -> Self {
        self.io_pool_size = size;
        self
    }

    /// Enable or disable the debug assertion on parser faults.
    pub fn with_protocol_fault_assert(mut self, enabled: bool) -> Self {
        self.assert_on_protocol_fault = enabled;
        self
    }
}

impl FromStr for SessionConfig {
    type Err = PackwireError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_url(s)
    }
}

fn split_host_port(authority: &str) -> Result<(String, u16)> {
    let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
        let (host, rest) = v6
            .split_once(']')
            .ok_or_else(|| PackwireError::invalid(format!("unterminated ipv6 host in {authority:?}")))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| PackwireError::invalid(format!("missing port in {authority:?}")))?;
        (host, port)
    } else {
        authority
            .rsplit_once(':')
            .ok_or_else(|| PackwireError::invalid(format!("missing port in {authority:?}")))?
    };

    if host.is_empty() {
        return Err(PackwireError::invalid(format!("missing host in {authority:?}")));
    }
    let port = parse_num("port", port)?;
    Ok((host.to_string(), port))
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| PackwireError::invalid(format!("{key} expects a number, got {value:?}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(PackwireError::invalid(format!(
            "{key} expects a boolean, got {value:?}"
        ))),
    }
}
