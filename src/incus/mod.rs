//! Typed asynchronous client for the Incus REST API
//!
//! Speaks the versioned HTTP API over the local Unix socket, surfacing the
//! response envelope semantics as typed results and background-operation
//! handles.

mod client;
mod errors;
mod traits;
mod types;

pub use client::{IncusClient, DEFAULT_SOCKET};
pub use errors::{IncusError, IncusResult};
pub use traits::{exec_wait, InstanceBackend, ProgressFn};
pub use types::*;
