//! Container creation

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{KapsuleError, Result};
use crate::incus::{IncusError, InstanceSource, InstancesPost, ProgressFn, StateAction};
use crate::ops::{MessageKind, Reporter};

use super::{
    validate_name, ContainerMode, ContainerService, HOSTFS_PATH, IMAGE_KEY, MODE_KEY, PTYXIS_KEY,
    STATE_CHANGE_CEILING,
};

/// Pre-registered simplestreams endpoints addressable by alias
const IMAGE_SERVERS: &[(&str, &str)] = &[("images", "https://images.linuxcontainers.org")];

/// Parsed form of the `<server-alias>:<image-path>` descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub server: String,
    pub protocol: String,
    pub alias: String,
    /// The descriptor as given, echoed into container metadata
    pub descriptor: String,
}

impl ImageRef {
    /// Parse an image descriptor. A descriptor without a server alias
    /// selects the `images` remote.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let (server_alias, alias) = descriptor
            .split_once(':')
            .unwrap_or(("images", descriptor));

        if alias.is_empty() {
            return Err(KapsuleError::InvalidArgument(
                "image descriptor is empty".to_string(),
            ));
        }

        let server = IMAGE_SERVERS
            .iter()
            .find(|(known, _)| *known == server_alias)
            .map(|(_, url)| url.to_string())
            .ok_or_else(|| {
                KapsuleError::InvalidArgument(format!("unknown image server: {}", server_alias))
            })?;

        Ok(Self {
            server,
            protocol: "simplestreams".to_string(),
            alias: alias.to_string(),
            descriptor: if descriptor.contains(':') {
                descriptor.to_string()
            } else {
                format!("images:{}", descriptor)
            },
        })
    }
}

/// Build the instance spec carrying the kapsule container profile
fn build_spec(name: &str, image: &ImageRef, mode: ContainerMode) -> InstancesPost {
    let config = HashMap::from([
        ("security.privileged".to_string(), "true".to_string()),
        ("security.nesting".to_string(), "true".to_string()),
        ("raw.lxc".to_string(), "lxc.net.0.type=none".to_string()),
        (MODE_KEY.to_string(), mode.as_str().to_string()),
        (IMAGE_KEY.to_string(), image.descriptor.clone()),
    ]);

    let devices = HashMap::from([
        (
            "root".to_string(),
            HashMap::from([
                ("type".to_string(), "disk".to_string()),
                ("path".to_string(), "/".to_string()),
                ("pool".to_string(), "default".to_string()),
            ]),
        ),
        (
            "gpu".to_string(),
            HashMap::from([
                ("type".to_string(), "gpu".to_string()),
                // Conventional video group
                ("gid".to_string(), "44".to_string()),
            ]),
        ),
        (
            "hostfs".to_string(),
            HashMap::from([
                ("type".to_string(), "disk".to_string()),
                ("source".to_string(), "/".to_string()),
                ("path".to_string(), HOSTFS_PATH.to_string()),
                ("recursive".to_string(), "true".to_string()),
            ]),
        ),
    ]);

    InstancesPost {
        name: name.to_string(),
        source: InstanceSource {
            kind: "image".to_string(),
            protocol: image.protocol.clone(),
            server: image.server.clone(),
            alias: image.alias.clone(),
        },
        kind: "container".to_string(),
        config,
        devices,
    }
}

impl ContainerService {
    /// Create a container and start it.
    pub async fn create_container(
        &self,
        reporter: &Reporter,
        token: &CancellationToken,
        name: &str,
        image: &str,
        session_mode: bool,
        dbus_mux: bool,
    ) -> Result<()> {
        validate_name(name)?;
        let mode = ContainerMode::from_flags(session_mode, dbus_mux)?;

        match self.backend().get_instance(name).await {
            Ok(_) => return Err(KapsuleError::ContainerAlreadyExists(name.to_string())),
            Err(IncusError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let descriptor = if image.is_empty() {
            self.config().default_image.clone()
        } else {
            image.to_string()
        };
        let image_ref = ImageRef::parse(&descriptor)?;

        reporter.info(format!(
            "Creating container {} from {}",
            name, image_ref.descriptor
        ));

        let spec = build_spec(name, &image_ref, mode);
        let operation = self.backend().create_instance(&spec).await?;

        let progress = {
            let reporter = reporter.clone();
            Some(Box::new(move |message: &str| {
                reporter.message(MessageKind::Info, message, 1);
            }) as ProgressFn)
        };

        if let Err(e) = self
            .wait_cancellable(token, &operation, None, progress)
            .await
        {
            return self.unwind_create(reporter, name, e).await;
        }

        if token.is_cancelled() {
            return self.unwind_create(reporter, name, KapsuleError::Cancelled).await;
        }

        reporter.info(format!("Starting container {}", name));
        let operation = self
            .backend()
            .update_instance_state(name, StateAction::Start, false, 0)
            .await?;
        match self
            .wait_cancellable(token, &operation, Some(STATE_CHANGE_CEILING), None)
            .await
        {
            Ok(_) => {}
            // The instance exists at this point; only a cancellation takes
            // it back down.
            Err(e) if e.is_cancelled() => return self.unwind_create(reporter, name, e).await,
            Err(e) => return Err(e),
        }

        self.record_terminal_profile(reporter, name).await;

        reporter.success(format!("Container {} is ready", name));
        Ok(())
    }

    /// Best-effort terminal profile registration; never fails the create.
    async fn record_terminal_profile(&self, reporter: &Reporter, name: &str) {
        let Some(ptyxis) = self.ptyxis() else {
            return;
        };
        let Some(profile) = ptyxis.create_profile(name).await else {
            debug!("No terminal profile created for {}", name);
            return;
        };

        let patch = serde_json::json!({ "config": { PTYXIS_KEY: profile } });
        match self.backend().update_instance_config(name, &patch).await {
            Ok(()) => reporter.dim(format!("Registered terminal profile {}", profile)),
            Err(e) => warn!("Could not record terminal profile for {}: {}", name, e),
        }
    }

    /// Remove a partially created instance after a failed or cancelled
    /// create, preserving the original error.
    async fn unwind_create(
        &self,
        reporter: &Reporter,
        name: &str,
        cause: KapsuleError,
    ) -> Result<()> {
        reporter.warning(format!("Removing partially created container {}", name));

        let cleanup = async {
            match self.backend().get_instance(name).await {
                Ok(_) => {
                    let operation = self.backend().delete_instance(name).await?;
                    self.backend()
                        .wait_operation(&operation, Some(STATE_CHANGE_CEILING), None)
                        .await?;
                    Ok::<(), IncusError>(())
                }
                Err(IncusError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            }
        };

        match cleanup.await {
            Ok(()) => Err(cause),
            Err(e) => {
                warn!("Cleanup of {} failed: {}", name, e);
                if cause.is_cancelled() {
                    Err(KapsuleError::CancelledCleanupFailed(e.to_string()))
                } else {
                    Err(cause)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::MockBackend;
    use super::*;
    use crate::config::Configuration;
    use crate::ops::ProgressEvent;
    use std::sync::Arc;

    fn service(backend: Arc<MockBackend>) -> ContainerService {
        ContainerService::new(backend, Configuration::default(), None)
    }

    fn reporter() -> (Reporter, tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) {
        Reporter::channel()
    }

    #[test]
    fn test_image_ref_parse() {
        let image = ImageRef::parse("images:ubuntu/24.04").unwrap();
        assert_eq!(image.server, "https://images.linuxcontainers.org");
        assert_eq!(image.protocol, "simplestreams");
        assert_eq!(image.alias, "ubuntu/24.04");
        assert_eq!(image.descriptor, "images:ubuntu/24.04");
    }

    #[test]
    fn test_image_ref_defaults_to_images_remote() {
        let image = ImageRef::parse("archlinux").unwrap();
        assert_eq!(image.alias, "archlinux");
        assert_eq!(image.descriptor, "images:archlinux");
    }

    #[test]
    fn test_image_ref_rejects_unknown_server_and_empty() {
        assert!(ImageRef::parse("warehouse:debian/12").is_err());
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("images:").is_err());
    }

    #[test]
    fn test_spec_carries_profile() {
        let image = ImageRef::parse("images:alpine/edge").unwrap();
        let spec = build_spec("dev", &image, ContainerMode::Session);

        assert_eq!(spec.kind, "container");
        assert_eq!(spec.config["security.privileged"], "true");
        assert_eq!(spec.config["security.nesting"], "true");
        assert_eq!(spec.config["raw.lxc"], "lxc.net.0.type=none");
        assert_eq!(spec.config[MODE_KEY], "session");
        assert_eq!(spec.config[IMAGE_KEY], "images:alpine/edge");

        assert_eq!(spec.devices["root"]["pool"], "default");
        assert_eq!(spec.devices["gpu"]["type"], "gpu");
        assert_eq!(spec.devices["hostfs"]["source"], "/");
        assert_eq!(spec.devices["hostfs"]["path"], HOSTFS_PATH);
        assert_eq!(spec.devices["hostfs"]["recursive"], "true");
    }

    #[tokio::test]
    async fn test_create_starts_container() {
        let backend = Arc::new(MockBackend::new());
        let service = service(backend.clone());
        let (reporter, _rx) = reporter();

        service
            .create_container(
                &reporter,
                &CancellationToken::new(),
                "dev",
                "images:alpine/edge",
                false,
                false,
            )
            .await
            .unwrap();

        let instances = backend.instances.lock();
        let instance = &instances["dev"];
        assert_eq!(instance.status, "Running");
        assert_eq!(instance.config[MODE_KEY], "default");
    }

    #[tokio::test]
    async fn test_create_rejects_existing_name() {
        let backend = Arc::new(MockBackend::new());
        backend.insert_instance(MockBackend::instance("dev", "Running"));
        let service = service(backend);
        let (reporter, _rx) = reporter();

        let err = service
            .create_container(
                &reporter,
                &CancellationToken::new(),
                "dev",
                "images:alpine/edge",
                false,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KapsuleError::ContainerAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_name_and_mode_pair() {
        let service = service(Arc::new(MockBackend::new()));
        let (reporter, _rx) = reporter();
        let token = CancellationToken::new();

        let err = service
            .create_container(&reporter, &token, "2bad", "", false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, KapsuleError::InvalidArgument(_)));

        let err = service
            .create_container(&reporter, &token, "dev", "", true, true)
            .await
            .unwrap_err();
        assert!(matches!(err, KapsuleError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_create_empty_image_uses_default() {
        let backend = Arc::new(MockBackend::new());
        let service = service(backend.clone());
        let (reporter, _rx) = reporter();

        service
            .create_container(&reporter, &CancellationToken::new(), "dev", "", false, false)
            .await
            .unwrap();

        let instances = backend.instances.lock();
        assert_eq!(instances["dev"].config[IMAGE_KEY], "images:archlinux");
    }

    #[tokio::test]
    async fn test_cancel_during_create_removes_instance() {
        let backend = Arc::new(MockBackend::new());
        let service = Arc::new(service(backend.clone()));
        let (reporter, _rx) = reporter();
        let token = CancellationToken::new();

        // Every wait hangs, standing in for a long image download
        backend
            .hanging_ops
            .lock()
            .insert("/1.0/operations/mock-1".to_string());

        let task = {
            let service = service.clone();
            let token = token.clone();
            tokio::spawn(async move {
                service
                    .create_container(&reporter, &token, "dev", "images:ubuntu/24.04", false, false)
                    .await
            })
        };

        tokio::task::yield_now().await;
        token.cancel();

        let result = task.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert!(!backend.instances.lock().contains_key("dev"));
    }
}
