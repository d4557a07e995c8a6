//! Smart Meter Emulation Library
//!
//! Polls a real energy source (an Enphase Envoy gateway) on a fixed interval and
//! republishes the readings through an emulated Shelly Pro 3EM, so that
//! consumers which only speak the Shelly API can use them.

pub mod backend;
pub mod config;
pub mod discovery;
pub mod error;
pub mod frontend;
pub mod identity;
pub mod meter_data;
pub mod poller;
pub mod snapshot_store;

// Re-export commonly used types for easier access
pub use backend::{create_backend, Backend};
pub use config::AppConfig;
pub use error::{ConfigError, PollError};
pub use frontend::{create_frontend, Frontend};
pub use meter_data::{MeterSnapshot, PhaseCount, PhaseReading};
pub use poller::Poller;
pub use snapshot_store::SnapshotStore;
