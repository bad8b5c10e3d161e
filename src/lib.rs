//! Kapsule Daemon Library
//!
//! Core functionality for the Kapsule daemon: the typed Incus client, the
//! operation engine, the container service, and the D-Bus facade.

pub mod bus;
pub mod config;
pub mod error;
pub mod incus;
pub mod ops;
pub mod service;

// Re-export commonly used types
pub use config::Configuration;
pub use error::{DbusError, KapsuleError};
pub use ops::OperationEngine;
pub use service::ContainerService;
