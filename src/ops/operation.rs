//! Operation records

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use zbus::zvariant::OwnedObjectPath;

/// Type tag of a user-facing operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Delete,
    Start,
    Stop,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Delete => write!(f, "delete"),
            OperationKind::Start => write!(f, "start"),
            OperationKind::Stop => write!(f, "stop"),
        }
    }
}

/// Observable lifecycle state of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationStatus::Running)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Running => write!(f, "Running"),
            OperationStatus::Completed => write!(f, "Completed"),
            OperationStatus::Failed => write!(f, "Failed"),
            OperationStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Shared state of one live operation.
///
/// The engine owns the arena of these, indexed by id; the exported D-Bus
/// object and the driver task hold clones of the `Arc`.
pub struct OperationShared {
    id: u64,
    kind: OperationKind,
    target: String,
    path: OwnedObjectPath,
    status: RwLock<OperationStatus>,
    token: CancellationToken,
}

impl OperationShared {
    pub fn new(
        id: u64,
        kind: OperationKind,
        target: impl Into<String>,
        path: OwnedObjectPath,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            kind,
            target: target.into(),
            path,
            status: RwLock::new(OperationStatus::Running),
            token,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn path(&self) -> &OwnedObjectPath {
        &self.path
    }

    pub fn status(&self) -> OperationStatus {
        *self.status.read()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Transition into a terminal state. Only the first transition wins;
    /// returns whether this call was the one that transitioned.
    pub fn finish(&self, status: OperationStatus) -> bool {
        debug_assert!(status.is_terminal());
        let mut current = self.status.write();
        if current.is_terminal() {
            return false;
        }
        *current = status;
        true
    }

    /// Arm the cancellation token. A no-op once terminal.
    pub fn cancel(&self) {
        if !self.status().is_terminal() {
            self.token.cancel();
        }
    }
}
