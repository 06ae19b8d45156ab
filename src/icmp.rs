//! Reachability probe boundary.
//!
//! Raw ICMP echo packet construction needs `CAP_NET_RAW` and is
//! intentionally out of scope here; the shipped implementation is a
//! TCP-connect reachability check behind the same trait a real raw-socket
//! prober would implement, so the worker's dispatch logic is fully
//! exercised and testable in environments without that capability.

use std::net::ToSocketAddrs;
use std::time::Duration;

#[async_trait::async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Attempt to reach `host` within `timeout`. `Ok` carries the observed
    /// round-trip latency.
    async fn probe(&self, host: &str, timeout: Duration) -> anyhow::Result<Duration>;
}

/// Connects to a well-known port as a reachability stand-in for ICMP echo.
pub struct TcpConnectProbe {
    pub port: u16,
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        Self { port: 443 }
    }
}

#[async_trait::async_trait]
impl ReachabilityProbe for TcpConnectProbe {
    async fn probe(&self, host: &str, timeout: Duration) -> anyhow::Result<Duration> {
        let addr = format!("{host}:{}", self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("could not resolve {host}"))?;

        let started = std::time::Instant::now();
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await??;
        Ok(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFails;

    #[async_trait::async_trait]
    impl ReachabilityProbe for AlwaysFails {
        async fn probe(&self, _host: &str, _timeout: Duration) -> anyhow::Result<Duration> {
            anyhow::bail!("unreachable")
        }
    }

    #[tokio::test]
    async fn failing_probe_is_an_error() {
        let probe = AlwaysFails;
        assert!(probe.probe("example.invalid", Duration::from_millis(1)).await.is_err());
    }
}
