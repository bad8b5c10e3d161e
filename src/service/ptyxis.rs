//! Ptyxis terminal-profile integration
//!
//! Best effort only: profile bookkeeping never decides the outcome of a
//! container operation. Failures are logged and swallowed.

use tracing::debug;
use zbus::Connection;

const PTYXIS_NAME: &str = "org.gnome.Ptyxis";
const PTYXIS_PATH: &str = "/org/gnome/Ptyxis";
const PTYXIS_IFACE: &str = "org.gnome.Ptyxis";

/// Client for the terminal emulator's profile service
pub struct PtyxisClient {
    connection: Connection,
}

impl PtyxisClient {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    async fn proxy(&self) -> zbus::Result<zbus::Proxy<'_>> {
        zbus::Proxy::new(&self.connection, PTYXIS_NAME, PTYXIS_PATH, PTYXIS_IFACE).await
    }

    /// Request a profile for the container; `None` when the collaborator
    /// is absent or refuses.
    pub async fn create_profile(&self, container: &str) -> Option<String> {
        let result: zbus::Result<String> = async {
            let proxy = self.proxy().await?;
            proxy.call("CreateProfile", &(container,)).await
        }
        .await;

        match result {
            Ok(profile) => Some(profile),
            Err(e) => {
                debug!("Ptyxis profile for {} not created: {}", container, e);
                None
            }
        }
    }

    /// Remove a recorded profile; reports whether the call went through.
    pub async fn delete_profile(&self, profile: &str) -> bool {
        let result: zbus::Result<()> = async {
            let proxy = self.proxy().await?;
            proxy.call("DeleteProfile", &(profile,)).await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                debug!("Ptyxis profile {} not removed: {}", profile, e);
                false
            }
        }
    }
}
