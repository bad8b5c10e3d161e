//! Caller identity resolution
//!
//! Resolves the uid, gid, pid and a fixed environment slice of a D-Bus
//! caller from the bus daemon's credentials query and the process
//! filesystem.

use std::collections::HashMap;

use tracing::debug;
use zbus::names::BusName;
use zbus::Connection;

use crate::error::{KapsuleError, Result};

/// Environment variables captured from the caller's process
pub const CAPTURED_ENV: &[&str] = &[
    "DISPLAY",
    "WAYLAND_DISPLAY",
    "XAUTHORITY",
    "XDG_RUNTIME_DIR",
    "TERM",
    "LANG",
    "SHELL",
    "PATH",
];

/// Identity of a D-Bus caller, immutable for the life of the call it seeds
#[derive(Debug, Clone)]
pub struct CallerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub username: String,
    /// Host home directory of the account
    pub home: String,
    pub env: HashMap<String, String>,
}

/// Resolve the credentials of `sender` on `connection`.
pub async fn resolve(connection: &Connection, sender: &str) -> Result<CallerCredentials> {
    let proxy = zbus::fdo::DBusProxy::new(connection)
        .await
        .map_err(|e| KapsuleError::Internal(format!("bus daemon proxy: {}", e)))?;

    let name = BusName::try_from(sender)
        .map_err(|_| KapsuleError::UnknownCaller(sender.to_string()))?;
    let credentials = proxy
        .get_connection_credentials(name)
        .await
        .map_err(|_| KapsuleError::UnknownCaller(sender.to_string()))?;

    let uid = credentials
        .unix_user_id()
        .ok_or_else(|| KapsuleError::UnknownCaller(sender.to_string()))?;
    let pid = credentials
        .process_id()
        .ok_or_else(|| KapsuleError::UnknownCaller(sender.to_string()))?;

    let status = tokio::fs::read_to_string(format!("/proc/{}/status", pid))
        .await
        .map_err(|_| KapsuleError::CallerGone(pid))?;
    let gid = parse_status_gid(&status).ok_or(KapsuleError::CallerGone(pid))?;

    let env = match tokio::fs::read(format!("/proc/{}/environ", pid)).await {
        Ok(bytes) => parse_environ(&bytes),
        Err(e) => {
            debug!("Environment of pid {} unreadable: {}", pid, e);
            HashMap::new()
        }
    };

    let passwd = tokio::fs::read_to_string("/etc/passwd")
        .await
        .unwrap_or_default();
    let (username, home) = host_account(&passwd, uid).ok_or_else(|| {
        KapsuleError::UnknownCaller(format!("uid {} has no host account", uid))
    })?;

    Ok(CallerCredentials {
        uid,
        gid,
        pid,
        username,
        home,
        env,
    })
}

/// Real gid from a `/proc/<pid>/status` dump
fn parse_status_gid(status: &str) -> Option<u32> {
    status
        .lines()
        .find(|line| line.starts_with("Gid:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// Filter a NUL-separated environ blob down to the captured slice
fn parse_environ(environ: &[u8]) -> HashMap<String, String> {
    environ
        .split(|&b| b == 0)
        .filter_map(|chunk| {
            let chunk = std::str::from_utf8(chunk).ok()?;
            let (key, value) = chunk.split_once('=')?;
            CAPTURED_ENV
                .contains(&key)
                .then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Account name and home for a uid, from the host account database
fn host_account(passwd: &str, uid: u32) -> Option<(String, String)> {
    passwd.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 6 {
            return None;
        }
        if fields[2].parse::<u32>().ok()? != uid {
            return None;
        }
        Some((fields[0].to_string(), fields[5].to_string()))
    })
}
