//! Delivery channels for dose reminders.
//!
//! `provider` defines the uniform channel contract; `timer` and `http` are
//! the in-process and push-backend implementations.

pub mod http;
pub mod provider;
pub mod timer;
