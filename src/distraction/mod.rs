pub mod classifier;
pub mod tracker;

pub use classifier::{classify, ClassifierContext, DistractionScope, Verdict};
pub use tracker::{DistractionTracker, SwitchOutcome, BACKGROUND_APP_NAME};
