//! HTTP client with retry logic for the Incus Unix-socket API

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::{UnixConnector, Uri};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::errors::{IncusError, IncusResult};
use super::traits::{InstanceBackend, ProgressFn};
use super::types::*;

/// Maximum number of retry attempts for transient socket failures
const MAX_RETRIES: u32 = 3;

/// Base delay between retries (exponentially increased)
const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Maximum delay between retries
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Per-poll timeout passed to the operation wait endpoint, in seconds
const WAIT_POLL_SECS: u64 = 1;

/// Default location of the Incus control socket
pub const DEFAULT_SOCKET: &str = "/var/lib/incus/unix.socket";

/// HTTP client for the Incus daemon on a local Unix socket
pub struct IncusClient {
    client: Client<UnixConnector, Full<Bytes>>,
    socket: PathBuf,
}

impl IncusClient {
    /// Create a client against the given control socket.
    ///
    /// The underlying hyper client pools connections and is safe for
    /// concurrent calls.
    pub fn new(socket: impl AsRef<Path>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(UnixConnector);
        Self {
            client,
            socket: socket.as_ref().to_path_buf(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Check that the API root answers
    pub async fn ping(&self) -> IncusResult<()> {
        self.request(Method::GET, "/1.0", None).await.map(|_| ())
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff(attempt: u32) -> Duration {
        let delay = BASE_RETRY_DELAY * 2u32.pow(attempt - 1);
        std::cmp::min(delay, MAX_RETRY_DELAY)
    }

    /// Perform a request, retrying transient socket failures
    async fn request_raw(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
        headers: &[(&'static str, String)],
    ) -> IncusResult<(StatusCode, Bytes)> {
        let mut last_error: Option<IncusError> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = Self::calculate_backoff(attempt);
                debug!(
                    "Retrying {} {} (attempt {}/{}), waiting {:?}",
                    method,
                    path,
                    attempt + 1,
                    MAX_RETRIES + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            let uri: hyper::Uri = Uri::new(&self.socket, path).into();
            let mut builder = Request::builder().method(method.clone()).uri(uri);
            for (name, value) in headers {
                builder = builder.header(*name, value);
            }

            let request = builder
                .body(Full::new(body.clone()))
                .map_err(|e| IncusError::InvalidRequest(e.to_string()))?;

            match self.client.request(request).await {
                Ok(response) => {
                    let status = response.status();
                    let bytes = response.into_body().collect().await?.to_bytes();
                    trace!("{} {} -> {}", method, path, status);
                    return Ok((status, bytes));
                }
                Err(e) => {
                    let error = IncusError::Transport(e);
                    if error.is_retryable() && attempt < MAX_RETRIES {
                        warn!("Request {} {} failed (attempt {}): {}", method, path, attempt + 1, error);
                        last_error = Some(error);
                        continue;
                    }
                    return Err(error);
                }
            }
        }

        Err(IncusError::RetryExhausted(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        ))
    }

    /// Perform an enveloped JSON request
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> IncusResult<Envelope> {
        let bytes = match body {
            Some(value) => Bytes::from(serde_json::to_vec(value)?),
            None => Bytes::new(),
        };
        let json_header = [("Content-Type", "application/json".to_string())];
        let headers: &[(&'static str, String)] = if bytes.is_empty() { &[] } else { &json_header };

        let (status, body) = self.request_raw(method, path, bytes, headers).await?;
        Self::parse_envelope(status, &body)
    }

    /// Convert the response envelope semantics into typed results
    fn parse_envelope(status: StatusCode, body: &Bytes) -> IncusResult<Envelope> {
        let envelope: Envelope = serde_json::from_slice(body)?;

        if envelope.kind == ResponseType::Error || status.as_u16() >= 400 {
            let code = if envelope.error_code != 0 {
                envelope.error_code
            } else {
                status.as_u16() as u32
            };
            let message = if envelope.error.is_empty() {
                envelope.status
            } else {
                envelope.error
            };

            if code == 404 {
                return Err(IncusError::NotFound(message));
            }
            return Err(IncusError::Api {
                status: code,
                message,
            });
        }

        Ok(envelope)
    }

    /// Perform a request expecting a synchronous envelope and decode its metadata
    async fn sync_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> IncusResult<T> {
        let envelope = self.request(method, path, body).await?;
        Ok(serde_json::from_value(envelope.metadata)?)
    }

    /// Perform a request expecting an asynchronous envelope and return its handle
    async fn async_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> IncusResult<BackendOperation> {
        let envelope = self.request(method, path, body).await?;

        if !envelope.operation.is_empty() {
            return Ok(BackendOperation::new(envelope.operation));
        }

        // Some endpoints only carry the id in the operation metadata
        if let Some(id) = envelope.metadata.get("id").and_then(Value::as_str) {
            return Ok(BackendOperation::new(format!("/1.0/operations/{}", id)));
        }

        Err(IncusError::InvalidRequest(
            "async response without an operation URL".to_string(),
        ))
    }

    /// Build the files endpoint URL with an encoded path query
    fn files_url(name: &str, path: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("path", path)
            .finish();
        format!("/1.0/instances/{}/files?{}", name, query)
    }

    /// Pull human-readable progress strings out of operation metadata
    fn extract_progress(metadata: &Value) -> Option<String> {
        let map = metadata.as_object()?;
        let mut parts: Vec<&str> = map
            .iter()
            .filter(|(key, _)| key.contains("progress"))
            .filter_map(|(_, value)| value.as_str())
            .collect();
        parts.sort_unstable();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

#[async_trait]
impl InstanceBackend for IncusClient {
    async fn list_instances(&self) -> IncusResult<Vec<Instance>> {
        self.sync_request(Method::GET, "/1.0/instances?recursion=1", None)
            .await
    }

    async fn get_instance(&self, name: &str) -> IncusResult<Instance> {
        self.sync_request(Method::GET, &format!("/1.0/instances/{}", name), None)
            .await
    }

    async fn get_instance_state(&self, name: &str) -> IncusResult<InstanceState> {
        self.sync_request(Method::GET, &format!("/1.0/instances/{}/state", name), None)
            .await
    }

    async fn create_instance(&self, spec: &InstancesPost) -> IncusResult<BackendOperation> {
        let body = serde_json::to_value(spec)?;
        self.async_request(Method::POST, "/1.0/instances", Some(&body))
            .await
    }

    async fn update_instance_state(
        &self,
        name: &str,
        action: StateAction,
        force: bool,
        timeout: i64,
    ) -> IncusResult<BackendOperation> {
        let body = serde_json::to_value(InstanceStatePut {
            action,
            timeout,
            force,
            stateful: false,
        })?;

        self.async_request(
            Method::PUT,
            &format!("/1.0/instances/{}/state", name),
            Some(&body),
        )
        .await
    }

    async fn update_instance_config(&self, name: &str, patch: &Value) -> IncusResult<()> {
        let envelope = self
            .request(Method::PATCH, &format!("/1.0/instances/{}", name), Some(patch))
            .await?;

        // PATCH answers synchronously, but tolerate an operation handle
        if envelope.kind == ResponseType::Async && !envelope.operation.is_empty() {
            let operation = BackendOperation::new(envelope.operation);
            self.wait_operation(&operation, Some(Duration::from_secs(30)), None)
                .await?;
        }
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> IncusResult<BackendOperation> {
        self.async_request(Method::DELETE, &format!("/1.0/instances/{}", name), None)
            .await
    }

    async fn exec_instance(&self, name: &str, request: &ExecPost) -> IncusResult<BackendOperation> {
        let body = serde_json::to_value(request)?;
        self.async_request(
            Method::POST,
            &format!("/1.0/instances/{}/exec", name),
            Some(&body),
        )
        .await
    }

    async fn push_file(
        &self,
        name: &str,
        path: &str,
        content: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> IncusResult<()> {
        let headers: [(&'static str, String); 5] = [
            ("X-Incus-uid", uid.to_string()),
            ("X-Incus-gid", gid.to_string()),
            ("X-Incus-mode", format!("{:04o}", mode)),
            ("X-Incus-type", "file".to_string()),
            ("X-Incus-write", "overwrite".to_string()),
        ];

        let (status, body) = self
            .request_raw(
                Method::POST,
                &Self::files_url(name, path),
                Bytes::copy_from_slice(content),
                &headers,
            )
            .await?;

        Self::parse_envelope(status, &body).map(|_| ())
    }

    async fn pull_file(&self, name: &str, path: &str) -> IncusResult<Vec<u8>> {
        let (status, body) = self
            .request_raw(Method::GET, &Self::files_url(name, path), Bytes::new(), &[])
            .await?;

        if status.as_u16() >= 400 {
            // Error replies on the files endpoint are regular envelopes
            return match Self::parse_envelope(status, &body) {
                Ok(_) => Err(IncusError::Api {
                    status: status.as_u16() as u32,
                    message: "unexpected envelope on file pull".to_string(),
                }),
                Err(e) => Err(e),
            };
        }

        Ok(body.to_vec())
    }

    async fn wait_operation(
        &self,
        operation: &BackendOperation,
        timeout: Option<Duration>,
        progress: Option<ProgressFn>,
    ) -> IncusResult<Value> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut last_progress = String::new();

        loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(IncusError::Timeout);
                }
            }

            let envelope = self
                .request(Method::GET, &operation.wait_url(WAIT_POLL_SECS), None)
                .await?;
            let remote: RemoteOperation = serde_json::from_value(envelope.metadata)?;

            if let Some(callback) = &progress {
                if let Some(message) = Self::extract_progress(&remote.metadata) {
                    if message != last_progress {
                        callback(&message);
                        last_progress = message;
                    }
                }
            }

            if !remote.is_terminal() {
                continue;
            }

            if remote.is_success() {
                return Ok(remote.metadata);
            }
            if remote.is_cancelled() {
                return Err(IncusError::Cancelled);
            }
            return Err(IncusError::Operation(if remote.err.is_empty() {
                format!("operation {} failed", remote.id)
            } else {
                remote.err
            }));
        }
    }
}
