//! longlink: persistent framed TCP link demo
//!
//! Two roles:
//! - `server`: echo server mirroring every byte back
//! - `client`: echo client over a persistent link, sending each stdin line
//!
//! Configuration via CLI arguments or TOML file.

use longlink::client::EchoClient;
use longlink::config::{Config, LinkConfig, Role, ServerConfig};
use longlink::server::Server;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match config.role {
        Role::Server(server) => runtime.block_on(run_server(server)),
        Role::Client(link) => runtime.block_on(run_client(link)),
    }
}

/// Serve until Ctrl-C
async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        "Starting echo server"
    );

    let server = Server::new(config);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

/// Send stdin lines until EOF or Ctrl-C
async fn run_client(config: LinkConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        addr = %config.addr(),
        retry_interval = ?config.retry_interval,
        heartbeat_interval = ?config.heartbeat_interval,
        heartbeat_timeout = ?config.heartbeat_timeout,
        "Starting echo client"
    );

    let client = EchoClient::connect(config);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    client.send(line.trim_end());
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Closing echo client");
    client.close();
    Ok(())
}
