//! Backend trait definition
//!
//! Abstracts the Incus client so the container service can be exercised
//! against a fake backend in tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::errors::IncusResult;
use super::types::{BackendOperation, ExecPost, Instance, InstanceState, InstancesPost, StateAction};

/// Callback receiving human-readable progress strings from a background
/// operation while it is being waited on.
pub type ProgressFn = Box<dyn Fn(&str) + Send + Sync>;

/// Typed surface of the Incus instance API consumed by the service layer
#[async_trait]
pub trait InstanceBackend: Send + Sync {
    /// List all instances with full records
    async fn list_instances(&self) -> IncusResult<Vec<Instance>>;

    /// Fetch one instance, `IncusError::NotFound` when absent
    async fn get_instance(&self, name: &str) -> IncusResult<Instance>;

    /// Fetch the runtime state of one instance
    async fn get_instance_state(&self, name: &str) -> IncusResult<InstanceState>;

    /// Create an instance; returns the backend operation handle
    async fn create_instance(&self, spec: &InstancesPost) -> IncusResult<BackendOperation>;

    /// Request a state change; returns the backend operation handle
    async fn update_instance_state(
        &self,
        name: &str,
        action: StateAction,
        force: bool,
        timeout: i64,
    ) -> IncusResult<BackendOperation>;

    /// Patch instance config and devices
    async fn update_instance_config(&self, name: &str, patch: &Value) -> IncusResult<()>;

    /// Delete an instance; returns the backend operation handle
    async fn delete_instance(&self, name: &str) -> IncusResult<BackendOperation>;

    /// Spawn a command inside an instance; returns the backend operation
    /// handle whose terminal metadata carries the exit code under `return`
    async fn exec_instance(&self, name: &str, request: &ExecPost) -> IncusResult<BackendOperation>;

    /// Write a file into an instance
    async fn push_file(
        &self,
        name: &str,
        path: &str,
        content: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> IncusResult<()>;

    /// Read a file out of an instance, `IncusError::NotFound` when absent
    async fn pull_file(&self, name: &str, path: &str) -> IncusResult<Vec<u8>>;

    /// Wait for a background operation to reach a terminal state.
    ///
    /// Idempotent. Progress strings from the operation metadata are passed
    /// to `progress` as they change. A `timeout` bounds the overall wait
    /// and maps to `IncusError::Timeout` when exceeded.
    async fn wait_operation(
        &self,
        operation: &BackendOperation,
        timeout: Option<Duration>,
        progress: Option<ProgressFn>,
    ) -> IncusResult<Value>;
}

/// Run a command in an instance and wait for its exit code.
///
/// Convenience wrapper over `exec_instance` + `wait_operation` used by the
/// provisioning paths.
pub async fn exec_wait(
    backend: &dyn InstanceBackend,
    name: &str,
    command: Vec<String>,
    env: HashMap<String, String>,
    uid: u32,
    gid: u32,
) -> IncusResult<i64> {
    let mut request = ExecPost::command(command, uid, gid);
    request.environment = env;

    let operation = backend.exec_instance(name, &request).await?;
    let metadata = backend
        .wait_operation(&operation, Some(Duration::from_secs(120)), None)
        .await?;

    Ok(metadata
        .get("return")
        .and_then(Value::as_i64)
        .unwrap_or(-1))
}
