mod connection;
pub mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use connection::Database;
pub use models::*;
pub use repositories::sync_state::{LAST_FULL_RECONCILE_AT, LAST_SYNC_AT};
