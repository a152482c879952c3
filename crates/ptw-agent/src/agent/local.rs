//! Reachability of the published local service

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Something the agent can probe before publishing it
#[async_trait]
pub trait LocalEndpoint: Send + Sync {
    /// Succeeds when the service accepts a connection
    async fn check(&self) -> io::Result<()>;
}

/// Bare TCP connect to `host:port`
#[derive(Debug, Clone)]
pub struct TcpEndpoint {
    address: String,
    timeout: Duration,
}

impl TcpEndpoint {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl LocalEndpoint for TcpEndpoint {
    async fn check(&self) -> io::Result<()> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("Connecting to {} timed out", self.address),
                )
            })??;
        drop(stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_succeeds_when_listening() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let endpoint = TcpEndpoint::new(address, Duration::from_secs(1));
        endpoint.check().await.unwrap();
    }

    #[tokio::test]
    async fn test_check_fails_when_nothing_listens() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let endpoint = TcpEndpoint::new(address, Duration::from_secs(1));
        let err = endpoint.check().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
