//! The exported Operation object

use std::sync::Arc;

use tracing::info;
use zbus::interface;
use zbus::object_server::SignalContext;

use crate::ops::OperationShared;

/// D-Bus face of one live operation
pub struct OperationIface {
    shared: Arc<OperationShared>,
}

impl OperationIface {
    pub fn new(shared: Arc<OperationShared>) -> Self {
        Self { shared }
    }
}

#[interface(name = "org.frostyard.Kapsule.Operation")]
impl OperationIface {
    #[zbus(property)]
    fn id(&self) -> String {
        self.shared.id().to_string()
    }

    #[zbus(property, name = "Type")]
    fn kind(&self) -> String {
        self.shared.kind().to_string()
    }

    #[zbus(property)]
    fn target(&self) -> String {
        self.shared.target().to_string()
    }

    #[zbus(property)]
    fn status(&self) -> String {
        self.shared.status().to_string()
    }

    /// Request cancellation. A no-op once the operation is terminal.
    async fn cancel(&self) {
        info!("Cancel requested for operation {}", self.shared.id());
        self.shared.cancel();
    }

    #[zbus(signal)]
    pub async fn message(
        ctxt: &SignalContext<'_>,
        r#type: i32,
        text: &str,
        indent: i32,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn progress_started(
        ctxt: &SignalContext<'_>,
        id: &str,
        description: &str,
        total: u64,
        indent: i32,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn progress_update(
        ctxt: &SignalContext<'_>,
        id: &str,
        current: u64,
        rate: f64,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn progress_completed(
        ctxt: &SignalContext<'_>,
        id: &str,
        success: bool,
        message: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn completed(ctxt: &SignalContext<'_>, success: bool, error: &str)
        -> zbus::Result<()>;
}
