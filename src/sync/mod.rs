//! Offline-first sync with the backend. Local rows are the source of truth
//! for this device; the backend is reconciled with last-write-wins.

pub mod client;
pub mod engine;
pub mod reachability;
pub mod types;
pub mod worker;

pub use client::{ApiError, ApiFuture, AuthState, HttpApi, RemoteApi};
pub use engine::{SyncEngine, SyncProgress, SyncReport, FULL_RECONCILE_EVERY};
pub use reachability::ReachabilityMonitor;
pub use worker::{sync_loop, SyncHandle, SyncRequest, SYNC_INTERVAL};
