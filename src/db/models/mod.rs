pub mod blocklist;
pub mod event;
pub mod session;
pub mod sync;
pub mod task;

pub use blocklist::{normalize_domain, BlockMode, BlockTarget, BlocklistItem};
pub use event::{EventType, NewEvent, SessionEvent};
pub use session::{Session, SessionCounters};
pub use sync::{SyncAction, SyncStatus, Syncable};
pub use task::{Project, Task, TaskFields, UpsertOutcome};
