use crate::signals::Shutdown;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Raw reachability check against the control endpoint.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn reachable(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

/// Bare TCP connect. Any failure, including DNS, is `false`, as is a
/// connect abandoned because a stop was requested.
pub struct TcpProbe {
    shutdown: Shutdown,
}

impl TcpProbe {
    pub fn new(shutdown: Shutdown) -> Self {
        Self { shutdown }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn reachable(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let attempt = tokio::select! {
            attempt = tokio::time::timeout(timeout, TcpStream::connect((host, port))) => attempt,
            _ = self.shutdown.triggered() => {
                tracing::debug!(host, port, "connect abandoned on shutdown");
                return false;
            }
        };
        match attempt {
            Ok(Ok(_)) => {
                tracing::debug!(host, port, "control endpoint reachable");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(host, port, error = %e, "control endpoint unreachable");
                false
            }
            Err(_) => {
                tracing::warn!(host, port, timeout_secs = timeout.as_secs(), "control endpoint connect timed out");
                false
            }
        }
    }
}
