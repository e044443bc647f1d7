use anyhow::{Context, Result};
use tokio::{net::TcpStream, sync::watch, task::JoinHandle, time::Duration};
use tokio_util::sync::CancellationToken;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_info;

pub const PROBE_EVERY: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Publishes whether the API host accepts TCP connections.
pub struct ReachabilityMonitor {
    host: String,
    port: u16,
}

impl ReachabilityMonitor {
    pub fn for_url(api_base_url: &str) -> Result<Self> {
        let url = url::Url::parse(api_base_url)
            .with_context(|| format!("invalid API url '{api_base_url}'"))?;
        let host = url
            .host_str()
            .with_context(|| format!("API url '{api_base_url}' has no host"))?
            .to_string();
        let port = url
            .port_or_known_default()
            .with_context(|| format!("API url '{api_base_url}' has no port"))?;
        Ok(Self { host, port })
    }

    pub async fn probe(&self) -> bool {
        matches!(
            tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((self.host.as_str(), self.port))).await,
            Ok(Ok(_))
        )
    }

    /// Probe now and then every [`PROBE_EVERY`] until cancelled. The
    /// receiver starts optimistic.
    pub fn spawn(self, cancel_token: CancellationToken) -> (watch::Receiver<bool>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(true);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROBE_EVERY);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let online = self.probe().await;
                        let changed = tx.send_if_modified(|current| {
                            let changed = *current != online;
                            *current = online;
                            changed
                        });
                        if changed {
                            log_info!("API host {}:{} is {}", self.host, self.port, if online { "reachable" } else { "unreachable" });
                        }
                    }
                }
            }
        });
        (rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probes_a_listening_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let monitor = ReachabilityMonitor::for_url(&format!("http://127.0.0.1:{port}/api/v1")).expect("url");
        assert!(monitor.probe().await);

        drop(listener);
        assert!(!monitor.probe().await);
    }

    #[test]
    fn default_ports_come_from_the_scheme() {
        let monitor = ReachabilityMonitor::for_url("https://api.example.com/v1").expect("url");
        assert_eq!(monitor.port, 443);
    }
}
