//! Service facade: the D-Bus surface of the daemon

pub mod caller;
pub mod manager;
pub mod operation;

pub use manager::ManagerIface;
pub use operation::OperationIface;

/// Well-known name owned by the daemon on the system bus
pub const BUS_NAME: &str = "org.frostyard.Kapsule";

/// Path of the Manager object
pub const MANAGER_PATH: &str = "/org/frostyard/Kapsule";
