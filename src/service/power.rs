//! Container state changes: start, stop, delete

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{KapsuleError, Result};
use crate::incus::StateAction;
use crate::ops::Reporter;

use super::{ContainerService, ContainerStatus, PTYXIS_KEY, STATE_CHANGE_CEILING, STOP_GRACE_SECS};

impl ContainerService {
    /// Start a container. Success when it is already running.
    pub async fn start_container(
        &self,
        reporter: &Reporter,
        token: &CancellationToken,
        name: &str,
    ) -> Result<()> {
        let instance = self.fetch(name).await?;

        if ContainerStatus::parse(&instance.status) == ContainerStatus::Running {
            reporter.success(format!("Container {} is already running", name));
            return Ok(());
        }

        reporter.info(format!("Starting container {}", name));
        let operation = self
            .backend()
            .update_instance_state(name, StateAction::Start, false, 0)
            .await?;
        self.wait_cancellable(token, &operation, Some(STATE_CHANGE_CEILING), None)
            .await?;

        reporter.success(format!("Container {} started", name));
        Ok(())
    }

    /// Stop a container. Success when it is already stopped.
    pub async fn stop_container(
        &self,
        reporter: &Reporter,
        token: &CancellationToken,
        name: &str,
        force: bool,
    ) -> Result<()> {
        let instance = self.fetch(name).await?;

        if ContainerStatus::parse(&instance.status) == ContainerStatus::Stopped {
            reporter.success(format!("Container {} is already stopped", name));
            return Ok(());
        }

        reporter.info(format!("Stopping container {}", name));
        let operation = self
            .backend()
            .update_instance_state(name, StateAction::Stop, force, STOP_GRACE_SECS)
            .await?;
        self.wait_cancellable(token, &operation, Some(STATE_CHANGE_CEILING), None)
            .await?;

        reporter.success(format!("Container {} stopped", name));
        Ok(())
    }

    /// Delete a container. A running container is refused unless `force`,
    /// in which case it is stopped first.
    pub async fn delete_container(
        &self,
        reporter: &Reporter,
        token: &CancellationToken,
        name: &str,
        force: bool,
    ) -> Result<()> {
        let instance = self.fetch(name).await?;

        if ContainerStatus::parse(&instance.status) == ContainerStatus::Running {
            if !force {
                return Err(KapsuleError::ContainerRunning(name.to_string()));
            }
            reporter.info(format!("Stopping container {}", name));
            let operation = self
                .backend()
                .update_instance_state(name, StateAction::Stop, true, STOP_GRACE_SECS)
                .await?;
            self.wait_cancellable(token, &operation, Some(STATE_CHANGE_CEILING), None)
                .await?;
        }

        self.drop_terminal_profile(&instance.config.get(PTYXIS_KEY).cloned())
            .await;

        reporter.info(format!("Deleting container {}", name));
        let operation = self.backend().delete_instance(name).await?;
        self.wait_cancellable(token, &operation, Some(STATE_CHANGE_CEILING), None)
            .await?;

        reporter.success(format!("Container {} deleted", name));
        Ok(())
    }

    /// Best-effort removal of a recorded terminal profile
    async fn drop_terminal_profile(&self, profile: &Option<String>) {
        let (Some(ptyxis), Some(profile)) = (self.ptyxis(), profile) else {
            return;
        };
        if profile.is_empty() {
            return;
        }
        if ptyxis.delete_profile(profile).await {
            debug!("Removed terminal profile {}", profile);
        } else {
            warn!("Could not remove terminal profile {}", profile);
        }
    }
}
