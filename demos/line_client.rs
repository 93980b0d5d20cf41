//! Line Client - send stdin lines to a server and print the replies.
//!
//! Pairs with the `echo_server` example:
//!
//! ```text
//! cargo run --example echo_server
//! cargo run --example line_client -- 127.0.0.1 7000
//! ```

use packwire::{Callbacks, Client, Delimited, SessionConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().as_deref().unwrap_or("7000").parse()?;

    let client = Client::builder(SessionConfig::new(host, port))
        .parser(Delimited::lines())
        .observer(
            Callbacks::new()
                .on_recv(|_, frame| print!("< {}", String::from_utf8_lossy(frame)))
                .on_close(|_, error| {
                    if let Some(e) = error {
                        eprintln!("connection closed: {}", e);
                    }
                }),
        )
        .start()
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if client.send(format!("{}\n", line)).is_err() {
            break;
        }
    }

    client.stop();
    client.stopped().await;
    Ok(())
}
