//! Operation engine
//!
//! Runs user-facing work items concurrently. Each submission gets an id
//! from a process-local counter, an exported D-Bus object, a cancellation
//! token, and its own driver task. The driver funnels reporter events and
//! the work future through one loop so subscribers observe a total order
//! of signals per operation.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zbus::object_server::SignalContext;
use zbus::zvariant::OwnedObjectPath;
use zbus::Connection;

use super::operation::{OperationKind, OperationShared, OperationStatus};
use super::progress::{ProgressEvent, Reporter};
use crate::bus::operation::OperationIface;
use crate::error::Result;

/// Object path subtree under which operations are exported
pub const OPERATIONS_PREFIX: &str = "/org/frostyard/Kapsule/operations";

/// How long a terminal operation stays published so slow subscribers can
/// still observe its final state
const LINGER: Duration = Duration::from_secs(5);

/// Upper bound on waiting for live operations during shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Engine owning the arena of live operations
pub struct OperationEngine {
    connection: Connection,
    operations: Arc<DashMap<u64, Arc<OperationShared>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl OperationEngine {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            operations: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Submit a work item.
    ///
    /// The Operation object is exported before this returns, so a caller
    /// holding the reply can always subscribe to it.
    pub async fn submit<F, Fut>(
        &self,
        kind: OperationKind,
        target: &str,
        work: F,
    ) -> zbus::Result<OwnedObjectPath>
    where
        F: FnOnce(Reporter, CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let path = OwnedObjectPath::try_from(format!("{}/{}", OPERATIONS_PREFIX, id))?;
        let token = self.shutdown.child_token();

        let shared = Arc::new(OperationShared::new(
            id,
            kind,
            target,
            path.clone(),
            token.clone(),
        ));

        self.connection
            .object_server()
            .at(path.as_str(), OperationIface::new(shared.clone()))
            .await?;
        self.operations.insert(id, shared.clone());

        info!("Operation {} started: {} {}", id, kind, target);

        let (reporter, rx) = Reporter::channel();
        let fut = work(reporter, token);

        tokio::spawn(drive(
            self.connection.clone(),
            self.operations.clone(),
            shared,
            rx,
            fut,
            self.shutdown.clone(),
        ));

        Ok(path)
    }

    /// Look up a live operation by id
    pub fn get(&self, id: u64) -> Option<Arc<OperationShared>> {
        self.operations.get(&id).map(|entry| entry.value().clone())
    }

    /// Number of operations still published
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Cancel every live operation and wait briefly for the arena to drain
    pub async fn shutdown(&self) {
        info!("Shutting down, {} operations live", self.operations.len());
        self.shutdown.cancel();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.operations.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if !self.operations.is_empty() {
            warn!(
                "{} operations did not terminate within the shutdown grace",
                self.operations.len()
            );
        }
    }
}

/// Drive one operation to completion: pump events, classify the outcome,
/// emit `Completed` exactly once, linger, then unpublish.
async fn drive(
    connection: Connection,
    operations: Arc<DashMap<u64, Arc<OperationShared>>>,
    shared: Arc<OperationShared>,
    mut rx: UnboundedReceiver<ProgressEvent>,
    work: impl Future<Output = Result<()>>,
    shutdown: CancellationToken,
) {
    let ctxt = match SignalContext::new(&connection, shared.path().as_str()) {
        Ok(ctxt) => ctxt,
        Err(e) => {
            warn!("Operation {}: no signal context: {}", shared.id(), e);
            return;
        }
    };

    let result = pump(work, &mut rx, |event| emit(&ctxt, event)).await;

    let (status, success, error) = match result {
        Ok(()) => (OperationStatus::Completed, true, String::new()),
        Err(e) if e.is_cancelled() => (OperationStatus::Cancelled, false, e.to_string()),
        Err(e) => (OperationStatus::Failed, false, e.to_string()),
    };

    if shared.finish(status) {
        info!(
            "Operation {} ({} {}) finished: {}",
            shared.id(),
            shared.kind(),
            shared.target(),
            status
        );
        if let Err(e) = OperationIface::completed(&ctxt, success, &error).await {
            warn!("Operation {}: failed to emit Completed: {}", shared.id(), e);
        }
    }

    // Keep the object observable for slow subscribers, unless the daemon
    // itself is going down.
    tokio::select! {
        _ = tokio::time::sleep(LINGER) => {}
        _ = shutdown.cancelled() => {}
    }

    if let Err(e) = connection
        .object_server()
        .remove::<OperationIface, _>(shared.path().as_str())
        .await
    {
        debug!("Operation {}: unpublish failed: {}", shared.id(), e);
    }
    operations.remove(&shared.id());
}

/// Run the work future while forwarding reporter events in order.
///
/// Remaining events are drained before the outcome is returned, so every
/// progress signal precedes the `Completed` signal.
async fn pump<W, E, EFut>(
    work: W,
    rx: &mut UnboundedReceiver<ProgressEvent>,
    mut emit: E,
) -> Result<()>
where
    W: Future<Output = Result<()>>,
    E: FnMut(ProgressEvent) -> EFut,
    EFut: Future<Output = ()>,
{
    tokio::pin!(work);

    let result = loop {
        tokio::select! {
            biased;
            event = rx.recv() => {
                match event {
                    Some(event) => emit(event).await,
                    // All reporters dropped before the work resolved
                    None => break (&mut work).await,
                }
            }
            result = &mut work => break result,
        }
    };

    while let Ok(event) = rx.try_recv() {
        emit(event).await;
    }

    result
}

async fn emit(ctxt: &SignalContext<'_>, event: ProgressEvent) {
    let result = match event {
        ProgressEvent::Message { kind, text, indent } => {
            OperationIface::message(ctxt, kind.code(), &text, indent).await
        }
        ProgressEvent::ProgressStarted {
            id,
            description,
            total,
            indent,
        } => OperationIface::progress_started(ctxt, &id, &description, total, indent).await,
        ProgressEvent::ProgressUpdate { id, current, rate } => {
            OperationIface::progress_update(ctxt, &id, current, rate).await
        }
        ProgressEvent::ProgressCompleted {
            id,
            success,
            message,
        } => OperationIface::progress_completed(ctxt, &id, success, &message).await,
    };

    if let Err(e) = result {
        warn!("Failed to emit progress signal: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KapsuleError;
    use crate::ops::progress::MessageKind;
    use parking_lot::Mutex;

    fn collector() -> (
        Arc<Mutex<Vec<ProgressEvent>>>,
        impl FnMut(ProgressEvent) -> std::future::Ready<()>,
    ) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let captured = sink.clone();
        let emit = move |event| {
            captured.lock().push(event);
            std::future::ready(())
        };
        (sink, emit)
    }

    #[tokio::test]
    async fn test_pump_emits_all_events_before_returning() {
        let (reporter, mut rx) = Reporter::channel();
        let (sink, emit) = collector();

        let work = async move {
            reporter.info("step one");
            reporter.progress_start("dl", "Downloading", 0, 1);
            reporter.progress_end("dl", true, "");
            reporter.success("done");
            Ok(())
        };

        let result = pump(work, &mut rx, emit).await;
        assert!(result.is_ok());

        let events = sink.lock();
        assert_eq!(events.len(), 4);
        assert!(matches!(
            &events[0],
            ProgressEvent::Message { kind: MessageKind::Info, .. }
        ));
        assert!(matches!(
            &events[3],
            ProgressEvent::Message { kind: MessageKind::Success, .. }
        ));
    }

    #[tokio::test]
    async fn test_pump_returns_work_error_after_drain() {
        let (reporter, mut rx) = Reporter::channel();
        let (sink, emit) = collector();

        let work = async move {
            reporter.error("about to fail");
            Err(KapsuleError::Internal("boom".into()))
        };

        let result = pump(work, &mut rx, emit).await;
        assert!(matches!(result, Err(KapsuleError::Internal(_))));
        assert_eq!(sink.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_pump_interleaves_events_with_suspensions() {
        let (reporter, mut rx) = Reporter::channel();
        let (sink, emit) = collector();

        let work = async move {
            for step in 0..3 {
                reporter.info(format!("step {}", step));
                tokio::task::yield_now().await;
            }
            Ok(())
        };

        pump(work, &mut rx, emit).await.unwrap();

        let events = sink.lock();
        let texts: Vec<_> = events
            .iter()
            .map(|event| match event {
                ProgressEvent::Message { text, .. } => text.clone(),
                _ => panic!("unexpected event"),
            })
            .collect();
        assert_eq!(texts, vec!["step 0", "step 1", "step 2"]);
    }

    #[tokio::test]
    async fn test_pump_survives_early_reporter_drop() {
        let (reporter, mut rx) = Reporter::channel();
        let (sink, emit) = collector();

        let work = async move {
            reporter.info("only message");
            drop(reporter);
            tokio::task::yield_now().await;
            Ok(())
        };

        pump(work, &mut rx, emit).await.unwrap();
        assert_eq!(sink.lock().len(), 1);
    }
}
