//! Container service
//!
//! The policy layer: translates user-facing operations into compositions of
//! backend calls, applies the kapsule container profile, and runs the
//! prepare-enter algorithm.

mod create;
mod enter;
mod power;
mod ptyxis;

pub use create::ImageRef;
pub use ptyxis::PtyxisClient;

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::Configuration;
use crate::error::{KapsuleError, Result};
use crate::incus::{BackendOperation, Instance, InstanceBackend, ProgressFn};

/// Incus config key holding the container mode
pub const MODE_KEY: &str = "user.kapsule.mode";

/// Incus config key echoing the requested image descriptor
pub const IMAGE_KEY: &str = "user.kapsule.image";

/// Incus config key holding the recorded terminal profile id
pub const PTYXIS_KEY: &str = "user.kapsule.ptyxis-profile";

/// Mount point of the recursive host root bind inside every container
pub const HOSTFS_PATH: &str = "/.kapsule/host";

/// Ceiling on waits for container state transitions
pub(crate) const STATE_CHANGE_CEILING: Duration = Duration::from_secs(120);

/// Grace period handed to the backend for stop requests, in seconds
pub(crate) const STOP_GRACE_SECS: i64 = 30;

/// Observable container state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Starting,
    Stopping,
    Error,
    Unknown,
}

impl ContainerStatus {
    /// Map a backend status string, unrecognized values become Unknown
    pub fn parse(status: &str) -> Self {
        match status {
            "Running" => Self::Running,
            "Stopped" => Self::Stopped,
            "Starting" => Self::Starting,
            "Stopping" => Self::Stopping,
            "Error" => Self::Error,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Error => write!(f, "Error"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// The closed set of container modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerMode {
    Default,
    Session,
    DbusMux,
}

impl ContainerMode {
    /// Derive the mode from the create request flags
    pub fn from_flags(session_mode: bool, dbus_mux: bool) -> Result<Self> {
        match (session_mode, dbus_mux) {
            (false, false) => Ok(Self::Default),
            (true, false) => Ok(Self::Session),
            (false, true) => Ok(Self::DbusMux),
            (true, true) => Err(KapsuleError::InvalidArgument(
                "session_mode and dbus_mux are mutually exclusive".to_string(),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Session => "session",
            Self::DbusMux => "dbus-mux",
        }
    }

    pub fn parse(mode: &str) -> Self {
        match mode {
            "session" => Self::Session,
            "dbus-mux" => Self::DbusMux,
            _ => Self::Default,
        }
    }
}

impl std::fmt::Display for ContainerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of the `ListContainers` reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub name: String,
    pub status: ContainerStatus,
    pub image: String,
    pub created: String,
    pub mode: ContainerMode,
}

impl ContainerSummary {
    pub fn from_instance(instance: &Instance) -> Self {
        let image = instance
            .config
            .get(IMAGE_KEY)
            .or_else(|| instance.config.get("image.description"))
            .cloned()
            .unwrap_or_default();

        Self {
            name: instance.name.clone(),
            status: ContainerStatus::parse(&instance.status),
            image,
            created: instance
                .created_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            mode: ContainerMode::parse(
                instance.config.get(MODE_KEY).map(String::as_str).unwrap_or(""),
            ),
        }
    }

    /// The `(sssss)` wire tuple
    pub fn into_tuple(self) -> (String, String, String, String, String) {
        (
            self.name,
            self.status.to_string(),
            self.image,
            self.created,
            self.mode.to_string(),
        )
    }
}

/// Validate a container name against the backend naming rules:
/// starts with a letter; letters, digits and hyphens; at most 63 chars.
pub fn validate_name(name: &str) -> Result<()> {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z][a-zA-Z0-9-]{0,62}$").expect("static pattern")
    });

    if re.is_match(name) {
        Ok(())
    } else {
        Err(KapsuleError::InvalidArgument(format!(
            "invalid container name: {:?}",
            name
        )))
    }
}

/// The container service
pub struct ContainerService {
    backend: Arc<dyn InstanceBackend>,
    config: Configuration,
    ptyxis: Option<PtyxisClient>,
}

impl ContainerService {
    pub fn new(
        backend: Arc<dyn InstanceBackend>,
        config: Configuration,
        ptyxis: Option<PtyxisClient>,
    ) -> Self {
        Self {
            backend,
            config,
            ptyxis,
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub(crate) fn backend(&self) -> &dyn InstanceBackend {
        self.backend.as_ref()
    }

    pub(crate) fn ptyxis(&self) -> Option<&PtyxisClient> {
        self.ptyxis.as_ref()
    }

    /// Fetch an instance, reclassifying a backend 404 as ContainerNotFound
    pub(crate) async fn fetch(&self, name: &str) -> Result<Instance> {
        self.backend.get_instance(name).await.map_err(|e| match e {
            crate::incus::IncusError::NotFound(_) => {
                KapsuleError::ContainerNotFound(name.to_string())
            }
            other => KapsuleError::Backend(other),
        })
    }

    /// List all containers as summaries
    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let instances = self.backend.list_instances().await?;
        Ok(instances.iter().map(ContainerSummary::from_instance).collect())
    }

    /// Fetch one container summary
    pub async fn container_info(&self, name: &str) -> Result<ContainerSummary> {
        let instance = self.fetch(name).await?;
        Ok(ContainerSummary::from_instance(&instance))
    }

    /// Wait on a backend operation, discarding its result when the token
    /// fires between suspension points.
    pub(crate) async fn wait_cancellable(
        &self,
        token: &CancellationToken,
        operation: &BackendOperation,
        timeout: Option<Duration>,
        progress: Option<ProgressFn>,
    ) -> Result<Value> {
        tokio::select! {
            _ = token.cancelled() => Err(KapsuleError::Cancelled),
            result = self.backend.wait_operation(operation, timeout, progress) => Ok(result?),
        }
    }

    /// Poll the instance state until it reports Running, bounded by the
    /// state-change ceiling.
    pub(crate) async fn wait_until_running(&self, name: &str) -> Result<()> {
        let deadline = Instant::now() + STATE_CHANGE_CEILING;

        loop {
            let state = self.backend.get_instance_state(name).await?;
            match ContainerStatus::parse(&state.status) {
                ContainerStatus::Running => return Ok(()),
                ContainerStatus::Starting | ContainerStatus::Stopped => {}
                other => {
                    return Err(KapsuleError::ContainerInvalidState {
                        name: name.to_string(),
                        status: other.to_string(),
                    })
                }
            }

            if Instant::now() >= deadline {
                return Err(KapsuleError::Timeout(format!(
                    "container {} did not reach Running",
                    name
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockBackend;
    use super::*;

    fn service(backend: Arc<MockBackend>) -> ContainerService {
        ContainerService::new(backend, Configuration::default(), None)
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("dev").is_ok());
        assert!(validate_name("dev-box-2").is_ok());
        assert!(validate_name("D2").is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name("2dev").is_err());
        assert!(validate_name("-dev").is_err());
        assert!(validate_name("dev_box").is_err());
        assert!(validate_name("dev box").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_mode_from_flags() {
        assert_eq!(
            ContainerMode::from_flags(false, false).unwrap(),
            ContainerMode::Default
        );
        assert_eq!(
            ContainerMode::from_flags(true, false).unwrap(),
            ContainerMode::Session
        );
        assert_eq!(
            ContainerMode::from_flags(false, true).unwrap(),
            ContainerMode::DbusMux
        );
        assert!(ContainerMode::from_flags(true, true).is_err());
    }

    #[test]
    fn test_mode_round_trip() {
        for mode in [
            ContainerMode::Default,
            ContainerMode::Session,
            ContainerMode::DbusMux,
        ] {
            assert_eq!(ContainerMode::parse(mode.as_str()), mode);
        }
        assert_eq!(ContainerMode::parse("bogus"), ContainerMode::Default);
    }

    #[test]
    fn test_status_parse_unknown_fallback() {
        assert_eq!(ContainerStatus::parse("Running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("Frozen"), ContainerStatus::Unknown);
        assert_eq!(ContainerStatus::parse(""), ContainerStatus::Unknown);
    }

    #[tokio::test]
    async fn test_list_reflects_backend() {
        let backend = Arc::new(MockBackend::new());
        let mut a = MockBackend::instance("alpha", "Running");
        a.config.insert(IMAGE_KEY.to_string(), "images:alpine/edge".to_string());
        a.config.insert(MODE_KEY.to_string(), "session".to_string());
        backend.insert_instance(a);
        backend.insert_instance(MockBackend::instance("beta", "Stopped"));

        let service = service(backend);
        let list = service.list_containers().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "alpha");
        assert_eq!(list[0].image, "images:alpine/edge");
        assert_eq!(list[0].mode, ContainerMode::Session);
        assert_eq!(list[1].status, ContainerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_info_not_found_is_reclassified() {
        let service = service(Arc::new(MockBackend::new()));
        let err = service.container_info("ghost").await.unwrap_err();
        assert!(matches!(err, KapsuleError::ContainerNotFound(_)));
    }

    #[test]
    fn test_summary_tuple_shape() {
        let mut instance = MockBackend::instance("dev", "Running");
        instance
            .config
            .insert(IMAGE_KEY.to_string(), "images:archlinux".to_string());
        let tuple = ContainerSummary::from_instance(&instance).into_tuple();
        assert_eq!(tuple.0, "dev");
        assert_eq!(tuple.1, "Running");
        assert_eq!(tuple.2, "images:archlinux");
        assert!(!tuple.3.is_empty());
        assert_eq!(tuple.4, "default");
    }
}
