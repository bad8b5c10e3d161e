//! Wire types for the Incus REST API

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level response discriminator used by every Incus endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Sync,
    Async,
    Error,
}

/// The response envelope wrapping every JSON reply
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: ResponseType,

    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub status_code: u32,

    /// URL of the background operation, set on `async` responses
    #[serde(default)]
    pub operation: String,

    #[serde(default)]
    pub error_code: u32,

    #[serde(default)]
    pub error: String,

    #[serde(default)]
    pub metadata: Value,
}

/// Handle to a background operation on the backend
#[derive(Debug, Clone)]
pub struct BackendOperation {
    /// Operation URL, e.g. `/1.0/operations/<uuid>`
    pub url: String,
}

impl BackendOperation {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Wait endpoint for this operation with a per-poll timeout in seconds
    pub fn wait_url(&self, timeout_secs: u64) -> String {
        format!("{}/wait?timeout={}", self.url, timeout_secs)
    }
}

/// Background operation record as returned by the operations endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteOperation {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub description: String,

    pub status_code: u32,

    #[serde(default)]
    pub metadata: Value,

    #[serde(default)]
    pub err: String,

    #[serde(default)]
    pub may_cancel: bool,
}

impl RemoteOperation {
    /// Operation status codes: 2xx success, 400 failure, 401 cancelled,
    /// anything else still running.
    pub fn is_terminal(&self) -> bool {
        (200..300).contains(&self.status_code) || self.status_code == 400 || self.status_code == 401
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_cancelled(&self) -> bool {
        self.status_code == 401
    }
}

/// Instance record (`GET /1.0/instances/<name>`)
#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub name: String,

    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub status_code: u32,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub config: HashMap<String, String>,

    #[serde(default)]
    pub devices: HashMap<String, HashMap<String, String>>,
}

/// Runtime state subset (`GET /1.0/instances/<name>/state`)
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceState {
    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub status_code: u32,

    #[serde(default)]
    pub pid: i64,
}

/// Image source for instance creation
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSource {
    #[serde(rename = "type")]
    pub kind: String,

    pub protocol: String,

    pub server: String,

    pub alias: String,
}

/// Request body for `POST /1.0/instances`
#[derive(Debug, Clone, Serialize)]
pub struct InstancesPost {
    pub name: String,

    pub source: InstanceSource,

    #[serde(rename = "type")]
    pub kind: String,

    pub config: HashMap<String, String>,

    pub devices: HashMap<String, HashMap<String, String>>,
}

/// State change actions accepted by `PUT /1.0/instances/<name>/state`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateAction {
    Start,
    Stop,
    Restart,
    Freeze,
    Unfreeze,
}

impl std::fmt::Display for StateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateAction::Start => write!(f, "start"),
            StateAction::Stop => write!(f, "stop"),
            StateAction::Restart => write!(f, "restart"),
            StateAction::Freeze => write!(f, "freeze"),
            StateAction::Unfreeze => write!(f, "unfreeze"),
        }
    }
}

/// Request body for `PUT /1.0/instances/<name>/state`
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatePut {
    pub action: StateAction,

    /// Grace period in seconds before the action is forced, -1 to wait forever
    pub timeout: i64,

    pub force: bool,

    pub stateful: bool,
}

/// Request body for `POST /1.0/instances/<name>/exec`
#[derive(Debug, Clone, Serialize)]
pub struct ExecPost {
    pub command: Vec<String>,

    pub environment: HashMap<String, String>,

    pub user: u32,

    pub group: u32,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub cwd: String,

    pub interactive: bool,

    #[serde(rename = "wait-for-websocket")]
    pub wait_for_websocket: bool,

    #[serde(rename = "record-output")]
    pub record_output: bool,
}

impl ExecPost {
    /// A non-interactive command run as the given user, output discarded
    pub fn command(command: Vec<String>, uid: u32, gid: u32) -> Self {
        Self {
            command,
            environment: HashMap::new(),
            user: uid,
            group: gid,
            cwd: String::new(),
            interactive: false,
            wait_for_websocket: false,
            record_output: false,
        }
    }
}
