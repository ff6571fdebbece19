//! Durable primary channel for daemon runtimes.
//!
//! Alarms live in a slot table keyed by handle, so a second alarm with the
//! same handle replaces the first. The dispatcher fires due slots into the
//! delivery listener; slots survive process restarts.

pub mod channel;
pub mod dispatcher;
pub mod slots;

pub use channel::DurableAlarmChannel;
pub use slots::{AlarmSlot, AlarmSlotStore, MemorySlotStore, PgSlotStore};
