//! TCP echo server.
//!
//! Mirrors every byte back to the sender without interpreting it. Because
//! frames are echoed verbatim, a heartbeat probe comes back as its own
//! acknowledgement and a data frame comes back as the same data frame.

use crate::config::ServerConfig;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 1024;

/// Echo server instance
pub struct Server {
    config: ServerConfig,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));
        Server {
            config,
            connection_limit,
        }
    }

    /// Bind the configured address and serve until the task is dropped
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %self.config.listen, "Echo server listening");
        self.serve(listener).await
    }

    /// Accept and serve connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            // Wait for a connection slot
            let permit = Arc::clone(&self.connection_limit)
                .acquire_owned()
                .await
                .map_err(std::io::Error::other)?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    tokio::spawn(async move {
                        match handle_connection(stream).await {
                            Ok(echoed) => debug!(peer = %addr, echoed, "Connection finished"),
                            Err(e) => debug!(peer = %addr, error = %e, "Connection error"),
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Mirror bytes until the client closes. Returns the number of bytes echoed.
async fn handle_connection(mut stream: TcpStream) -> std::io::Result<u64> {
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut echoed = 0u64;

    loop {
        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            trace!("Connection closed by client");
            return Ok(echoed);
        }

        stream.write_all(&buffer).await?;
        echoed += n as u64;
        buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, write_frame, Frame};
    use bytes::Bytes;

    async fn spawn_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let server = Server::new(ServerConfig::default());
            let _ = server.serve(listener).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_echoes_raw_bytes() {
        let addr = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"not even framed").await.unwrap();
        let mut buf = [0u8; 15];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"not even framed");
    }

    #[tokio::test]
    async fn test_echoes_frames_and_heartbeats() {
        let addr = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        write_frame(&mut client, b"").await.unwrap();
        write_frame(&mut client, b"hello").await.unwrap();

        assert_eq!(read_frame(&mut client).await.unwrap(), Frame::Heartbeat);
        assert_eq!(
            read_frame(&mut client).await.unwrap(),
            Frame::Data(Bytes::from_static(b"hello"))
        );
    }

    #[tokio::test]
    async fn test_connection_limit_defers_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let server = Server::new(ServerConfig {
                listen: addr.to_string(),
                max_connections: 1,
            });
            let _ = server.serve(listener).await;
        });

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"wait").await.unwrap();

        let mut buf = [0u8; 4];
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(100), second.read_exact(&mut buf)).await;
        assert!(blocked.is_err());

        // Freeing the first slot lets the second connection be served.
        first.shutdown().await.unwrap();
        let mut rest = Vec::new();
        first.read_to_end(&mut rest).await.unwrap();
        drop(first);

        second.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"wait");
    }
}
