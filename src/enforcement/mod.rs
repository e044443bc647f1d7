pub mod countdown;
pub mod engine;
pub mod handoff;
pub mod policy;
pub mod process;

pub use countdown::TIMED_LOCK_COOLDOWN;
pub use engine::{BlockDecision, BlockOverlay, EnforcementEngine};
pub use handoff::{read_snapshot, DomainSnapshot, SnapshotWriter};
pub use policy::{BlocklistPolicy, PolicyService};
pub use process::{ProcessTerminator, SysinfoTerminator};
