//! The DNS enforcement side. Runs in its own process (`tether-dns`) and
//! learns the blocked domains only through the snapshot file.

pub mod blocklist;
pub mod packet;
pub mod proxy;
pub mod watcher;

pub use blocklist::{DnsBlocklist, SharedBlocklist};
pub use packet::{nxdomain_response, parse_query, DnsHeader, DnsQuery, DnsQuestion};
pub use proxy::{DnsProxy, UPSTREAM_TIMEOUT};
pub use watcher::{load_blocklist, SnapshotWatcher};
