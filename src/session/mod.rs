mod controller;
mod state;

pub use controller::{
    SessionConfig, SessionController, SessionDeps, SessionNotification, SignalSource,
    EVENT_SYNC_BATCH,
};
pub use state::{
    ClassifyEnv, SessionMachine, SessionPhase, SessionSnapshot, StartEffects, TransitionEffects,
    CHECKPOINT_EVERY_SECS,
};
