//! Reminder scheduling: channel fallback, de-duplication and per-occurrence lifecycle.

pub mod dedup;
pub mod lifecycle;
pub mod orchestrator;

pub use dedup::DedupCache;
pub use lifecycle::{AlarmState, InvalidTransition, LifecycleBook};
pub use orchestrator::{Scheduler, SchedulerDeps};
