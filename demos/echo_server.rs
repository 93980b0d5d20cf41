//! Echo Server - line-delimited echo over TCP.
//!
//! This example demonstrates:
//! - Configuring a server from a URL string
//! - Splitting the byte stream into lines with the `Delimited` parser
//! - Echoing frames back and logging session events
//!
//! # Running
//!
//! ```text
//! RUST_LOG=debug cargo run --example echo_server -- "tcp://127.0.0.1:7000/?silence_timeout=30"
//! printf 'hello\nworld\n' | nc 127.0.0.1 7000
//! ```
//!
//! Press Enter on the server's terminal to stop it.

use packwire::{Callbacks, Delimited, Server, SessionConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://127.0.0.1:7000/?silence_timeout=60".to_string());
    let config: SessionConfig = url.parse()?;

    let server = Server::builder(config)
        .parser(Delimited::lines())
        .observer(
            Callbacks::new()
                .on_accept(|session| tracing::info!("{} connected from {}", session.id(), session.peer_addr()))
                .on_recv(|session, frame| {
                    if let Err(e) = session.send(frame.to_bytes()) {
                        tracing::warn!("Echo to {} failed: {}", session.id(), e);
                    }
                })
                .on_close(|session, error| match error {
                    Some(e) => tracing::info!("{} closed: {}", session.id(), e),
                    None => tracing::info!("{} closed", session.id()),
                })
                .on_shutdown(|_| tracing::info!("Server shut down")),
        )
        .build()?;

    let addr = server.start()?;
    println!("Echoing lines on {} (Enter to stop)", addr);

    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;

    server.stop_and_wait();
    Ok(())
}
