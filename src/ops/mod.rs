//! Operation engine: concurrent user-facing work items with progress
//! streaming, cancellation, and per-operation D-Bus objects.

mod engine;
mod operation;
mod progress;

pub use engine::{OperationEngine, OPERATIONS_PREFIX};
pub use operation::{OperationKind, OperationShared, OperationStatus};
pub use progress::{MessageKind, ProgressEvent, Reporter};
