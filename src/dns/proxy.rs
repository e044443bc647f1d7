use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use anyhow::{Context, Result};
use tokio::{net::UdpSocket, time::Duration};
use tokio_util::sync::CancellationToken;

use super::{
    blocklist::SharedBlocklist,
    packet::{nxdomain_response, parse_query},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_PACKET: usize = 4096;

/// UDP resolver front: answers blocked names with NXDOMAIN and relays
/// everything else to the upstream resolver byte for byte.
pub struct DnsProxy {
    socket: Arc<UdpSocket>,
    upstream: SocketAddr,
    blocklist: Arc<SharedBlocklist>,
}

impl DnsProxy {
    pub async fn bind(
        listen: SocketAddr,
        upstream: SocketAddr,
        blocklist: Arc<SharedBlocklist>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(listen)
            .await
            .with_context(|| format!("failed to bind DNS listener on {listen}"))?;
        Ok(Self {
            socket: Arc::new(socket),
            upstream,
            blocklist,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("listener has no local address")
    }

    /// Serve until `cancel` fires. Each query is handled on its own task so
    /// a slow upstream never stalls the listener.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        log_info!("DNS proxy listening on {}", self.local_addr()?);
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log_info!("DNS proxy stopping");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, client) = match received {
                        Ok(received) => received,
                        Err(err) => {
                            log_warn!("DNS receive failed: {err}");
                            continue;
                        }
                    };
                    let packet = buf[..len].to_vec();
                    let socket = self.socket.clone();
                    let blocklist = self.blocklist.clone();
                    let upstream = self.upstream;
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = answer(socket, packet, client, upstream, blocklist) => {}
                        }
                    });
                }
            }
        }
    }
}

async fn answer(
    socket: Arc<UdpSocket>,
    packet: Vec<u8>,
    client: SocketAddr,
    upstream: SocketAddr,
    blocklist: Arc<SharedBlocklist>,
) {
    let reply = match parse_query(&packet) {
        Ok(query) if blocklist.current().is_blocked(&query.question.name) => {
            log_debug!("blocked {} for {client}", query.question.name);
            Some(nxdomain_response(&packet, &query))
        }
        // Unparseable queries are still forwarded as-is.
        _ => match forward(&packet, upstream).await {
            Ok(reply) => Some(reply),
            Err(err) => {
                log_warn!("DNS forward to {upstream} failed: {err:#}");
                None
            }
        },
    };

    if let Some(reply) = reply {
        if let Err(err) = socket.send_to(&reply, client).await {
            log_warn!("DNS reply to {client} failed: {err}");
        }
    }
}

async fn forward(packet: &[u8], upstream: SocketAddr) -> Result<Vec<u8>> {
    let local: SocketAddr = if upstream.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await.context("failed to bind upstream socket")?;
    socket
        .connect(upstream)
        .await
        .context("failed to connect upstream socket")?;
    socket.send(packet).await.context("failed to send upstream")?;

    let mut buf = vec![0u8; MAX_PACKET];
    let len = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
        .await
        .context("upstream timed out")?
        .context("failed to read upstream reply")?;
    buf.truncate(len);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{blocklist::DnsBlocklist, packet::{build_query, DnsHeader}};

    /// Upstream that answers every query with a fixed marker appended.
    async fn fake_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind upstream");
        let addr = socket.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_PACKET];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let mut reply = buf[..len].to_vec();
                reply[2] |= 0x80;
                reply.extend_from_slice(b"upstream");
                let _ = socket.send_to(&reply, from).await;
            }
        });
        addr
    }

    async fn ask(proxy: SocketAddr, query: &[u8]) -> Vec<u8> {
        let client = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
        client.send_to(query, proxy).await.expect("send");
        let mut buf = [0u8; MAX_PACKET];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("reply in time")
            .expect("recv");
        buf[..len].to_vec()
    }

    #[tokio::test]
    async fn blocks_listed_domains_and_relays_the_rest() {
        let upstream = fake_upstream().await;
        let blocklist = Arc::new(SharedBlocklist::new(DnsBlocklist::new(
            1,
            ["blocked.com".to_string()],
        )));
        let proxy = DnsProxy::bind("127.0.0.1:0".parse().expect("addr"), upstream, blocklist)
            .await
            .expect("bind");
        let addr = proxy.local_addr().expect("addr");
        let cancel = CancellationToken::new();
        let server = tokio::spawn(proxy.run(cancel.clone()));

        let blocked = ask(addr, &build_query(0x4242, "sub.blocked.com", 1)).await;
        let header = DnsHeader::parse(&blocked).expect("header");
        assert_eq!(header.id, 0x4242);
        assert_eq!(header.rcode(), 3);
        assert_eq!((header.ancount, header.nscount, header.arcount), (0, 0, 0));

        let query = build_query(0x0707, "notblocked.com", 1);
        let relayed = ask(addr, &query).await;
        assert!(relayed.ends_with(b"upstream"));
        assert_eq!(&relayed[..2], &query[..2]);

        let garbage = ask(addr, b"\x01\x02not dns").await;
        assert!(garbage.ends_with(b"upstream"), "unparseable packets are forwarded");

        cancel.cancel();
        server.await.expect("join").expect("clean stop");
    }
}
