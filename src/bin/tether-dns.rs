//! Standalone resolver front. Reads the blocked-domain snapshot the main
//! process writes and answers those names with NXDOMAIN.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use log::info;
use tokio_util::sync::CancellationToken;

use tether_lib::{
    dns::{DnsProxy, SnapshotWatcher},
    settings::SettingsStore,
    utils::init_logging,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let settings = SettingsStore::open_default()?.effective();
    let listen: SocketAddr = settings
        .dns_listen_addr
        .parse()
        .with_context(|| format!("invalid listen address '{}'", settings.dns_listen_addr))?;
    let upstream: SocketAddr = settings
        .dns_upstream_addr
        .parse()
        .with_context(|| format!("invalid upstream address '{}'", settings.dns_upstream_addr))?;

    let watcher = SnapshotWatcher::start(settings.resolved_snapshot_path()?)?;
    let proxy = DnsProxy::bind(listen, upstream, watcher.blocklist()).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
        }
        on_signal.cancel();
    });

    proxy.run(cancel).await?;
    drop(watcher);
    Ok(())
}
