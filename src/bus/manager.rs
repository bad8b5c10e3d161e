//! The exported Manager object

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use zbus::interface;
use zbus::message::Header;
use zbus::zvariant::OwnedObjectPath;
use zbus::Connection;

use crate::error::DbusError;
use crate::ops::{OperationEngine, OperationKind};
use crate::service::ContainerService;

use super::caller;

type ContainerTuple = (String, String, String, String, String);

/// D-Bus face of the daemon
pub struct ManagerIface {
    service: Arc<ContainerService>,
    engine: Arc<OperationEngine>,
}

impl ManagerIface {
    pub fn new(service: Arc<ContainerService>, engine: Arc<OperationEngine>) -> Self {
        Self { service, engine }
    }
}

#[interface(name = "org.frostyard.Kapsule.Manager")]
impl ManagerIface {
    /// Create and start a container. Returns the Operation path; failures
    /// surface through the Operation's Completed signal.
    async fn create_container(
        &self,
        name: String,
        image: String,
        session_mode: bool,
        dbus_mux: bool,
    ) -> Result<OwnedObjectPath, DbusError> {
        let service = self.service.clone();
        let target = name.clone();

        let path = self
            .engine
            .submit(OperationKind::Create, &target, move |reporter, token| {
                async move {
                    service
                        .create_container(&reporter, &token, &name, &image, session_mode, dbus_mux)
                        .await
                }
            })
            .await?;
        Ok(path)
    }

    async fn delete_container(
        &self,
        name: String,
        force: bool,
    ) -> Result<OwnedObjectPath, DbusError> {
        let service = self.service.clone();
        let target = name.clone();

        let path = self
            .engine
            .submit(OperationKind::Delete, &target, move |reporter, token| {
                async move {
                    service
                        .delete_container(&reporter, &token, &name, force)
                        .await
                }
            })
            .await?;
        Ok(path)
    }

    async fn start_container(&self, name: String) -> Result<OwnedObjectPath, DbusError> {
        let service = self.service.clone();
        let target = name.clone();

        let path = self
            .engine
            .submit(OperationKind::Start, &target, move |reporter, token| {
                async move { service.start_container(&reporter, &token, &name).await }
            })
            .await?;
        Ok(path)
    }

    async fn stop_container(
        &self,
        name: String,
        force: bool,
    ) -> Result<OwnedObjectPath, DbusError> {
        let service = self.service.clone();
        let target = name.clone();

        let path = self
            .engine
            .submit(OperationKind::Stop, &target, move |reporter, token| {
                async move {
                    service
                        .stop_container(&reporter, &token, &name, force)
                        .await
                }
            })
            .await?;
        Ok(path)
    }

    /// Prepare a container for entry by the caller and return the argument
    /// vector to execute. Synchronous so the client can replace its process
    /// immediately.
    async fn prepare_enter(
        &self,
        container: String,
        command: Vec<String>,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> Result<(bool, String, Vec<String>), DbusError> {
        let sender = header
            .sender()
            .ok_or_else(|| DbusError::UnknownCaller("no sender on message".to_string()))?
            .to_string();

        let creds = match caller::resolve(connection, &sender).await {
            Ok(creds) => creds,
            Err(e @ crate::error::KapsuleError::UnknownCaller(_))
            | Err(e @ crate::error::KapsuleError::CallerGone(_)) => return Err(e.into()),
            Err(e) => return Ok((false, e.to_string(), Vec::new())),
        };

        debug!(
            "PrepareEnter for uid {} (pid {}) into {:?}",
            creds.uid, creds.pid, container
        );

        match self.service.prepare_enter(&creds, &container, &command).await {
            Ok(exec_args) => Ok((true, String::new(), exec_args)),
            Err(e) => Ok((false, e.to_string(), Vec::new())),
        }
    }

    async fn list_containers(&self) -> Result<Vec<ContainerTuple>, DbusError> {
        let summaries = self
            .service
            .list_containers()
            .await
            .map_err(DbusError::from)?;
        Ok(summaries.into_iter().map(|s| s.into_tuple()).collect())
    }

    async fn get_container_info(&self, name: String) -> Result<ContainerTuple, DbusError> {
        let summary = self
            .service
            .container_info(&name)
            .await
            .map_err(DbusError::from)?;
        Ok(summary.into_tuple())
    }

    async fn get_config(&self) -> HashMap<String, String> {
        self.service.config().entries()
    }

    #[zbus(property)]
    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }
}
