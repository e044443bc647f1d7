pub mod blocklist;
pub mod events;
pub mod sessions;
pub mod sync_state;
pub mod tasks;
