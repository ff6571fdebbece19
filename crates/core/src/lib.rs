pub mod bus;
pub mod config;
pub mod identity;
pub mod listener;
pub mod native;
pub mod permission;
pub mod probe;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod types;
