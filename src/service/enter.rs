//! Prepare-enter
//!
//! Materializes the caller's identity inside a container on first entry:
//! account provisioning, home bind-mount, session socket symlinks, and the
//! exec invocation the client replaces itself with.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info};

use crate::bus::caller::CallerCredentials;
use crate::error::{KapsuleError, Result};
use crate::incus::{exec_wait, StateAction};

use super::{ContainerService, ContainerStatus, HOSTFS_PATH, STATE_CHANGE_CEILING};

/// CLI binary the composed invocation starts with
const INCUS_CLI: &str = "incus";

/// One `/etc/passwd` entry
#[derive(Debug, Clone, PartialEq, Eq)]
struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
    home: String,
    shell: String,
}

fn parse_passwd_line(line: &str) -> Option<PasswdEntry> {
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < 7 {
        return None;
    }
    Some(PasswdEntry {
        name: fields[0].to_string(),
        uid: fields[2].parse().ok()?,
        gid: fields[3].parse().ok()?,
        home: fields[5].to_string(),
        shell: fields[6].to_string(),
    })
}

fn entry_for_uid(passwd: &str, uid: u32) -> Option<PasswdEntry> {
    passwd
        .lines()
        .filter_map(parse_passwd_line)
        .find(|entry| entry.uid == uid)
}

fn name_exists(passwd: &str, name: &str) -> bool {
    passwd
        .lines()
        .filter_map(parse_passwd_line)
        .any(|entry| entry.name == name)
}

/// Distro families with distinct provisioning commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Distro {
    Alpine,
    Arch,
    Debian,
    Fedora,
    Other,
}

impl Distro {
    fn from_os_release(content: &str) -> Self {
        let id = os_release_value(content, "ID").unwrap_or_default();
        let like = os_release_value(content, "ID_LIKE").unwrap_or_default();
        let matches = |needle: &str| id == needle || like.split_whitespace().any(|w| w == needle);

        if matches("alpine") {
            Distro::Alpine
        } else if matches("arch") {
            Distro::Arch
        } else if matches("debian") || matches("ubuntu") {
            Distro::Debian
        } else if matches("fedora") || matches("rhel") || matches("centos") {
            Distro::Fedora
        } else {
            Distro::Other
        }
    }
}

fn os_release_value(content: &str, key: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        if k.trim() != key {
            return None;
        }
        Some(v.trim().trim_matches('"').trim_matches('\'').to_string())
    })
}

/// First admin group the container knows about
fn admin_group(groups: &str) -> Option<&'static str> {
    ["wheel", "sudo", "adm"]
        .into_iter()
        .find(|candidate| {
            groups
                .lines()
                .any(|line| line.split(':').next() == Some(*candidate))
        })
}

fn group_add_command(distro: Distro, gid: u32, name: &str) -> Vec<String> {
    match distro {
        Distro::Alpine => vec![
            "addgroup".into(),
            "-g".into(),
            gid.to_string(),
            name.into(),
        ],
        _ => vec![
            "groupadd".into(),
            "-g".into(),
            gid.to_string(),
            name.into(),
        ],
    }
}

fn user_add_command(distro: Distro, uid: u32, gid: u32, name: &str) -> Vec<String> {
    match distro {
        Distro::Alpine => vec![
            "adduser".into(),
            "-u".into(),
            uid.to_string(),
            "-D".into(),
            name.into(),
        ],
        _ => vec![
            "useradd".into(),
            "-u".into(),
            uid.to_string(),
            "-g".into(),
            gid.to_string(),
            "-m".into(),
            "-s".into(),
            "/bin/bash".into(),
            name.into(),
        ],
    }
}

/// Reassign an existing account to the caller's ids
fn user_move_command(uid: u32, gid: u32, name: &str) -> Vec<String> {
    vec![
        "usermod".into(),
        "-u".into(),
        uid.to_string(),
        "-g".into(),
        gid.to_string(),
        name.into(),
    ]
}

fn admin_membership_command(distro: Distro, group: &str, name: &str) -> Vec<String> {
    match distro {
        Distro::Alpine => vec!["addgroup".into(), name.into(), group.into()],
        _ => vec!["usermod".into(), "-aG".into(), group.into(), name.into()],
    }
}

fn sudo_install_command(distro: Distro) -> Option<Vec<String>> {
    let command = match distro {
        Distro::Alpine => "apk add sudo",
        Distro::Arch => "pacman -Sy --noconfirm sudo",
        Distro::Debian => "apt-get update && apt-get install -y sudo",
        Distro::Fedora => "dnf install -y sudo",
        Distro::Other => return None,
    };
    Some(vec!["sh".into(), "-c".into(), command.into()])
}

/// X socket name for a DISPLAY value, e.g. `:0` or `:0.0` -> `X0`
fn x11_socket_name(display: &str) -> Option<String> {
    let number = display.rsplit(':').next()?;
    let number = number.split('.').next()?;
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!("X{}", number))
}

fn sh_quote(value: &str) -> String {
    let plain = value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b"/_.:-=".contains(&b));
    if plain && !value.is_empty() {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// (target, link) pairs materialized under `/run/user/<uid>` and
/// `/tmp/.X11-unix`, all resolving through the hostfs bind.
fn runtime_links(uid: u32, env: &HashMap<String, String>) -> Vec<(String, String)> {
    let runtime_dir = env
        .get("XDG_RUNTIME_DIR")
        .cloned()
        .unwrap_or_else(|| format!("/run/user/{}", uid));
    let mut links = Vec::new();

    if let Some(wayland) = env.get("WAYLAND_DISPLAY") {
        links.push((
            format!("{}{}/{}", HOSTFS_PATH, runtime_dir, wayland),
            format!("/run/user/{}/{}", uid, wayland),
        ));
    }

    if let Some(xauthority) = env.get("XAUTHORITY") {
        if let Some(basename) = Path::new(xauthority).file_name().and_then(|n| n.to_str()) {
            links.push((
                format!("{}{}", HOSTFS_PATH, xauthority),
                format!("/run/user/{}/{}", uid, basename),
            ));
        }
    }

    for socket in ["pipewire-0", "pulse", "bus"] {
        links.push((
            format!("{}{}/{}", HOSTFS_PATH, runtime_dir, socket),
            format!("/run/user/{}/{}", uid, socket),
        ));
    }

    if let Some(display) = env.get("DISPLAY") {
        if let Some(socket) = x11_socket_name(display) {
            links.push((
                format!("{}/tmp/.X11-unix/{}", HOSTFS_PATH, socket),
                format!("/tmp/.X11-unix/{}", socket),
            ));
        }
    }

    links
}

/// Idempotent shell script creating the session symlinks
fn build_symlink_script(uid: u32, gid: u32, env: &HashMap<String, String>) -> String {
    let mut script = vec![
        "set -e".to_string(),
        format!("mkdir -p /run/user/{}", uid),
        format!("chown {}:{} /run/user/{}", uid, gid, uid),
        "mkdir -p /tmp/.X11-unix".to_string(),
    ];

    for (target, link) in runtime_links(uid, env) {
        script.push(format!("ln -sfn {} {}", sh_quote(&target), sh_quote(&link)));
    }

    script.join("\n")
}

/// The argument vector the client executes in place of its own process
fn compose_exec_args(
    container: &str,
    creds: &CallerCredentials,
    cwd: &str,
    shell: &str,
    command: &[String],
) -> Vec<String> {
    let mut args = vec![
        INCUS_CLI.to_string(),
        "exec".to_string(),
        container.to_string(),
        "--user".to_string(),
        creds.uid.to_string(),
        "--group".to_string(),
        creds.gid.to_string(),
        "--cwd".to_string(),
        cwd.to_string(),
    ];

    let mut push_env = |key: &str, value: String| {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    };

    for key in ["TERM", "DISPLAY", "WAYLAND_DISPLAY"] {
        if let Some(value) = creds.env.get(key) {
            push_env(key, value.clone());
        }
    }
    if let Some(xauthority) = creds.env.get("XAUTHORITY") {
        if let Some(basename) = Path::new(xauthority).file_name().and_then(|n| n.to_str()) {
            push_env("XAUTHORITY", format!("/run/user/{}/{}", creds.uid, basename));
        }
    }
    push_env("XDG_RUNTIME_DIR", format!("/run/user/{}", creds.uid));

    args.push("--".to_string());
    if command.is_empty() {
        args.push(shell.to_string());
        args.push("-l".to_string());
    } else {
        args.extend(command.iter().cloned());
    }

    args
}

impl ContainerService {
    /// Prepare a container for entry by the given caller and return the
    /// exec invocation. Synchronous from the client's perspective: no
    /// Operation object is involved.
    pub async fn prepare_enter(
        &self,
        creds: &CallerCredentials,
        container: &str,
        command: &[String],
    ) -> Result<Vec<String>> {
        let name = if container.is_empty() {
            self.config().default_container.as_str()
        } else {
            container
        };
        if name.is_empty() {
            return Err(KapsuleError::ContainerNotFound(
                "no container given and no default_container configured".to_string(),
            ));
        }
        let name = name.to_string();

        let instance = self.fetch(&name).await?;
        match ContainerStatus::parse(&instance.status) {
            ContainerStatus::Running => {}
            ContainerStatus::Stopped => {
                info!("Starting {} for enter", name);
                let operation = self
                    .backend()
                    .update_instance_state(&name, StateAction::Start, false, 0)
                    .await?;
                self.backend()
                    .wait_operation(&operation, Some(STATE_CHANGE_CEILING), None)
                    .await?;
                self.wait_until_running(&name).await?;
            }
            ContainerStatus::Starting => self.wait_until_running(&name).await?,
            other => {
                return Err(KapsuleError::ContainerInvalidState {
                    name,
                    status: other.to_string(),
                })
            }
        }

        let passwd = self.pull_text(&name, "/etc/passwd").await?;
        let entry = match entry_for_uid(&passwd, creds.uid) {
            Some(entry) => entry,
            None => self.provision_user(&name, creds, &passwd).await?,
        };

        self.ensure_home_device(&name, creds).await?;
        self.materialize_session_links(&name, creds).await?;

        let cwd = if creds.home.is_empty() {
            entry.home.clone()
        } else {
            creds.home.clone()
        };
        let shell = if entry.shell.is_empty() {
            "/bin/sh"
        } else {
            &entry.shell
        };

        Ok(compose_exec_args(&name, creds, &cwd, shell, command))
    }

    async fn pull_text(&self, name: &str, path: &str) -> Result<String> {
        let bytes = self.backend().pull_file(name, path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Create (or reassign) the caller's account inside the container and
    /// wire up admin-group sudo access.
    async fn provision_user(
        &self,
        name: &str,
        creds: &CallerCredentials,
        passwd: &str,
    ) -> Result<PasswdEntry> {
        let os_release = match self.backend().pull_file(name, "/etc/os-release").await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        };
        let distro = Distro::from_os_release(&os_release);
        info!(
            "Provisioning user {} (uid {}) in {} ({:?})",
            creds.username, creds.uid, name, distro
        );

        // The caller's primary group may not exist yet; failure here just
        // means it already does.
        let _ = self
            .run_in(name, group_add_command(distro, creds.gid, &creds.username))
            .await;

        let command = if name_exists(passwd, &creds.username) {
            debug!("Account name {} taken, reassigning uid", creds.username);
            user_move_command(creds.uid, creds.gid, &creds.username)
        } else {
            user_add_command(distro, creds.uid, creds.gid, &creds.username)
        };
        let code = self.run_in(name, command).await?;
        if code != 0 {
            return Err(KapsuleError::Internal(format!(
                "creating user {} in {} failed (exit {})",
                creds.username, name, code
            )));
        }

        let groups = self.pull_text(name, "/etc/group").await.unwrap_or_default();
        if let Some(group) = admin_group(&groups) {
            let code = self
                .run_in(name, admin_membership_command(distro, group, &creds.username))
                .await?;
            if code != 0 {
                return Err(KapsuleError::Internal(format!(
                    "adding {} to group {} failed (exit {})",
                    creds.username, group, code
                )));
            }

            self.ensure_sudo(name, distro).await?;
            let sudoers = format!("%{} ALL=(ALL:ALL) NOPASSWD: ALL\n", group);
            self.backend()
                .push_file(
                    name,
                    "/etc/sudoers.d/kapsule",
                    sudoers.as_bytes(),
                    0o440,
                    0,
                    0,
                )
                .await?;
        }

        let passwd = self.pull_text(name, "/etc/passwd").await?;
        entry_for_uid(&passwd, creds.uid).ok_or_else(|| {
            KapsuleError::Internal(format!(
                "user {} not present in {} after provisioning",
                creds.username, name
            ))
        })
    }

    async fn ensure_sudo(&self, name: &str, distro: Distro) -> Result<()> {
        let probe = vec!["sh".to_string(), "-c".to_string(), "command -v sudo".to_string()];
        if self.run_in(name, probe).await? == 0 {
            return Ok(());
        }

        let Some(install) = sudo_install_command(distro) else {
            debug!("No sudo install command for this distro, skipping");
            return Ok(());
        };
        let code = self.run_in(name, install).await?;
        if code != 0 {
            return Err(KapsuleError::Internal(format!(
                "installing sudo in {} failed (exit {})",
                name, code
            )));
        }
        Ok(())
    }

    /// Bind the caller's home into the container at the same path, once.
    async fn ensure_home_device(&self, name: &str, creds: &CallerCredentials) -> Result<()> {
        if creds.home.is_empty() {
            return Ok(());
        }

        let instance = self.fetch(name).await?;
        let mounted = instance
            .devices
            .values()
            .any(|device| device.get("path") == Some(&creds.home));
        if mounted {
            return Ok(());
        }

        debug!("Attaching home device {} to {}", creds.home, name);
        let patch = serde_json::json!({
            "devices": {
                "home": {
                    "type": "disk",
                    "source": creds.home,
                    "path": creds.home,
                }
            }
        });
        self.backend().update_instance_config(name, &patch).await?;
        Ok(())
    }

    /// Create the session socket symlinks, idempotently.
    async fn materialize_session_links(
        &self,
        name: &str,
        creds: &CallerCredentials,
    ) -> Result<()> {
        let script = build_symlink_script(creds.uid, creds.gid, &creds.env);
        let command = vec!["sh".to_string(), "-c".to_string(), script];
        let code = self.run_in(name, command).await?;
        if code != 0 {
            return Err(KapsuleError::Internal(format!(
                "preparing session sockets in {} failed (exit {})",
                name, code
            )));
        }
        Ok(())
    }

    /// Run a command as root inside the container, returning its exit code
    async fn run_in(&self, name: &str, command: Vec<String>) -> Result<i64> {
        Ok(exec_wait(self.backend(), name, command, HashMap::new(), 0, 0).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::MockBackend;
    use super::*;
    use crate::config::Configuration;
    use std::sync::Arc;

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\n\
                          daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
                          dev:x:1000:1000:Dev:/home/dev:/bin/bash\n";

    fn creds() -> CallerCredentials {
        CallerCredentials {
            uid: 1000,
            gid: 1000,
            pid: 4242,
            username: "dev".to_string(),
            home: "/home/dev".to_string(),
            env: HashMap::from([
                ("DISPLAY".to_string(), ":0".to_string()),
                ("WAYLAND_DISPLAY".to_string(), "wayland-0".to_string()),
                (
                    "XAUTHORITY".to_string(),
                    "/run/user/1000/xauth_abc".to_string(),
                ),
                ("XDG_RUNTIME_DIR".to_string(), "/run/user/1000".to_string()),
                ("TERM".to_string(), "xterm-256color".to_string()),
            ]),
        }
    }

    fn service(backend: Arc<MockBackend>) -> ContainerService {
        ContainerService::new(backend, Configuration::default(), None)
    }

    fn running_container(backend: &MockBackend, name: &str, passwd: &str, os_release: &str) {
        backend.insert_instance(MockBackend::instance(name, "Running"));
        backend.set_file(name, "/etc/passwd", passwd);
        if !os_release.is_empty() {
            backend.set_file(name, "/etc/os-release", os_release);
        }
    }

    #[test]
    fn test_passwd_lookup() {
        let entry = entry_for_uid(PASSWD, 1000).unwrap();
        assert_eq!(entry.name, "dev");
        assert_eq!(entry.gid, 1000);
        assert_eq!(entry.home, "/home/dev");
        assert_eq!(entry.shell, "/bin/bash");

        assert!(entry_for_uid(PASSWD, 1234).is_none());
        assert!(name_exists(PASSWD, "dev"));
        assert!(!name_exists(PASSWD, "ghost"));
    }

    #[test]
    fn test_passwd_skips_malformed_lines() {
        let content = "garbage\nroot:x:0:0:root:/root:/bin/sh\nbroken:x:notanumber:0:b:/:/bin/sh\n";
        assert!(entry_for_uid(content, 0).is_some());
        assert!(!name_exists(content, "broken"));
    }

    #[test]
    fn test_distro_detection() {
        assert_eq!(
            Distro::from_os_release("ID=alpine\nVERSION_ID=3.20\n"),
            Distro::Alpine
        );
        assert_eq!(Distro::from_os_release("ID=arch\n"), Distro::Arch);
        assert_eq!(
            Distro::from_os_release("ID=ubuntu\nID_LIKE=debian\n"),
            Distro::Debian
        );
        assert_eq!(
            Distro::from_os_release("ID=\"centos\"\nID_LIKE=\"rhel fedora\"\n"),
            Distro::Fedora
        );
        assert_eq!(Distro::from_os_release("ID=nixos\n"), Distro::Other);
        assert_eq!(Distro::from_os_release(""), Distro::Other);
    }

    #[test]
    fn test_admin_group_preference() {
        let groups = "root:x:0:\nwheel:x:998:\nsudo:x:27:\n";
        assert_eq!(admin_group(groups), Some("wheel"));

        let groups = "root:x:0:\nsudo:x:27:\n";
        assert_eq!(admin_group(groups), Some("sudo"));

        let groups = "root:x:0:\nadm:x:4:\n";
        assert_eq!(admin_group(groups), Some("adm"));

        assert_eq!(admin_group("root:x:0:\n"), None);
    }

    #[test]
    fn test_provisioning_commands() {
        assert_eq!(
            user_add_command(Distro::Arch, 1000, 1000, "dev"),
            vec!["useradd", "-u", "1000", "-g", "1000", "-m", "-s", "/bin/bash", "dev"]
        );
        assert_eq!(
            user_add_command(Distro::Alpine, 1000, 1000, "dev"),
            vec!["adduser", "-u", "1000", "-D", "dev"]
        );
        assert_eq!(
            user_move_command(1000, 1000, "dev"),
            vec!["usermod", "-u", "1000", "-g", "1000", "dev"]
        );
        assert_eq!(
            admin_membership_command(Distro::Debian, "sudo", "dev"),
            vec!["usermod", "-aG", "sudo", "dev"]
        );
        assert_eq!(
            admin_membership_command(Distro::Alpine, "adm", "dev"),
            vec!["addgroup", "dev", "adm"]
        );
        assert!(sudo_install_command(Distro::Other).is_none());
        assert!(sudo_install_command(Distro::Arch)
            .unwrap()
            .join(" ")
            .contains("pacman"));
    }

    #[test]
    fn test_x11_socket_name() {
        assert_eq!(x11_socket_name(":0").unwrap(), "X0");
        assert_eq!(x11_socket_name(":0.0").unwrap(), "X0");
        assert_eq!(x11_socket_name("localhost:10.0").unwrap(), "X10");
        assert!(x11_socket_name("wayland-0").is_none());
        assert!(x11_socket_name(":").is_none());
    }

    #[test]
    fn test_symlink_script_contents() {
        let creds = creds();
        let script = build_symlink_script(creds.uid, creds.gid, &creds.env);

        assert!(script.contains("mkdir -p /run/user/1000"));
        assert!(script.contains("chown 1000:1000 /run/user/1000"));
        assert!(script.contains(
            "ln -sfn /.kapsule/host/run/user/1000/wayland-0 /run/user/1000/wayland-0"
        ));
        assert!(script
            .contains("ln -sfn /.kapsule/host/run/user/1000/xauth_abc /run/user/1000/xauth_abc"));
        assert!(script.contains(
            "ln -sfn /.kapsule/host/run/user/1000/pipewire-0 /run/user/1000/pipewire-0"
        ));
        assert!(script.contains("ln -sfn /.kapsule/host/run/user/1000/pulse /run/user/1000/pulse"));
        assert!(script.contains("ln -sfn /.kapsule/host/run/user/1000/bus /run/user/1000/bus"));
        assert!(script.contains("ln -sfn /.kapsule/host/tmp/.X11-unix/X0 /tmp/.X11-unix/X0"));
    }

    #[test]
    fn test_symlink_script_without_display_env() {
        let script = build_symlink_script(1000, 1000, &HashMap::new());
        assert!(!script.contains("wayland"));
        assert!(!script.contains("X11-unix/X"));
        // Audio and session bus links are always attempted
        assert!(script.contains("pipewire-0"));
        assert!(script.contains("/run/user/1000/bus"));
    }

    #[test]
    fn test_sh_quote() {
        assert_eq!(sh_quote("/run/user/1000/bus"), "/run/user/1000/bus");
        assert_eq!(sh_quote("has space"), "'has space'");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_compose_exec_args_shape() {
        let creds = creds();
        let args = compose_exec_args("test-enter", &creds, "/home/dev", "/bin/bash", &[]);

        assert_eq!(args[0], INCUS_CLI);
        assert_eq!(args[1], "exec");
        assert_eq!(args[2], "test-enter");

        let joined = args.join(" ");
        assert!(joined.contains("--user 1000"));
        assert!(joined.contains("--group 1000"));
        assert!(joined.contains("--cwd /home/dev"));
        assert!(joined.contains("--env XDG_RUNTIME_DIR=/run/user/1000"));
        assert!(joined.contains("--env XAUTHORITY=/run/user/1000/xauth_abc"));
        assert!(joined.contains("--env DISPLAY=:0"));
        assert!(joined.ends_with("-- /bin/bash -l"));
    }

    #[test]
    fn test_compose_exec_args_with_command() {
        let creds = creds();
        let command = vec!["docker".to_string(), "ps".to_string()];
        let args = compose_exec_args("dev", &creds, "/home/dev", "/bin/bash", &command);
        assert!(args.join(" ").ends_with("-- docker ps"));
    }

    #[tokio::test]
    async fn test_enter_existing_user_skips_provisioning() {
        let backend = Arc::new(MockBackend::new());
        running_container(&backend, "test-enter", PASSWD, "ID=arch\n");
        let service = service(backend.clone());

        let args = service.prepare_enter(&creds(), "test-enter", &[]).await.unwrap();
        assert_eq!(args[0], "incus");

        // Only the symlink script ran
        let history = backend.exec_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0][0], "sh");
    }

    #[tokio::test]
    async fn test_enter_provisions_missing_user() {
        let backend = Arc::new(MockBackend::new());
        let passwd = "root:x:0:0:root:/root:/bin/bash\n";
        running_container(&backend, "test-enter", passwd, "ID=arch\n");
        backend.set_file("test-enter", "/etc/group", "root:x:0:\nwheel:x:998:\n");
        // group add ok, useradd ok, admin membership ok, sudo probe fails
        // (absent), install ok
        backend.exec_codes.lock().extend([0, 0, 0, 1, 0]);

        // First pull sees no account; the re-probe after provisioning does
        let provisioned = format!("{}dev:x:1000:1000:Dev:/home/dev:/bin/bash\n", passwd);
        backend.queue_file("test-enter", "/etc/passwd", passwd);
        backend.set_file("test-enter", "/etc/passwd", &provisioned);

        let service = service(backend.clone());
        let args = service.prepare_enter(&creds(), "test-enter", &[]).await.unwrap();
        assert!(args.join(" ").contains("--user 1000"));

        let history = backend.exec_history();
        let flattened: Vec<String> = history.iter().map(|cmd| cmd.join(" ")).collect();
        assert!(flattened.iter().any(|cmd| cmd == "groupadd -g 1000 dev"));
        assert!(flattened
            .iter()
            .any(|cmd| cmd == "useradd -u 1000 -g 1000 -m -s /bin/bash dev"));
        assert!(flattened.iter().any(|cmd| cmd == "usermod -aG wheel dev"));
        assert!(flattened.iter().any(|cmd| cmd.contains("pacman")));

        // Sudoers drop-in pushed for the admin group
        let files = backend.files.lock();
        let sudoers = files
            .get(&("test-enter".to_string(), "/etc/sudoers.d/kapsule".to_string()))
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(sudoers),
            "%wheel ALL=(ALL:ALL) NOPASSWD: ALL\n"
        );
    }

    #[tokio::test]
    async fn test_enter_reassigns_colliding_name() {
        let backend = Arc::new(MockBackend::new());
        // dev exists with a different uid
        let passwd = "root:x:0:0:root:/root:/bin/bash\ndev:x:1500:1500:Dev:/home/dev:/bin/bash\n";
        running_container(&backend, "box", passwd, "ID=debian\n");
        backend.set_file("box", "/etc/group", "root:x:0:\nsudo:x:27:\n");

        // First pull sees the colliding account; the re-probe after the
        // usermod sees the caller's uid
        let moved = "root:x:0:0:root:/root:/bin/bash\ndev:x:1000:1000:Dev:/home/dev:/bin/bash\n";
        backend.queue_file("box", "/etc/passwd", passwd);
        backend.set_file("box", "/etc/passwd", moved);

        let service = service(backend.clone());
        service.prepare_enter(&creds(), "box", &[]).await.unwrap();

        let flattened: Vec<String> = backend
            .exec_history()
            .iter()
            .map(|cmd| cmd.join(" "))
            .collect();
        assert!(flattened.iter().any(|cmd| cmd == "usermod -u 1000 -g 1000 dev"));
        assert!(!flattened.iter().any(|cmd| cmd.starts_with("useradd")));
    }

    #[tokio::test]
    async fn test_enter_attaches_home_once() {
        let backend = Arc::new(MockBackend::new());
        running_container(&backend, "test-enter", PASSWD, "ID=arch\n");
        let service = service(backend.clone());
        let creds = creds();

        service.prepare_enter(&creds, "test-enter", &[]).await.unwrap();
        {
            let instances = backend.instances.lock();
            let device = &instances["test-enter"].devices["home"];
            assert_eq!(device["type"], "disk");
            assert_eq!(device["source"], "/home/dev");
            assert_eq!(device["path"], "/home/dev");
        }

        // Second entry leaves the device list alone
        service.prepare_enter(&creds, "test-enter", &[]).await.unwrap();
        assert_eq!(backend.patches.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_enter_is_idempotent() {
        let backend = Arc::new(MockBackend::new());
        running_container(&backend, "test-enter", PASSWD, "ID=arch\n");
        let service = service(backend.clone());
        let creds = creds();

        let first = service.prepare_enter(&creds, "test-enter", &[]).await.unwrap();
        let second = service.prepare_enter(&creds, "test-enter", &[]).await.unwrap();
        assert_eq!(first, second);

        // Both runs executed the same idempotent symlink script
        let history = backend.exec_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], history[1]);
    }

    #[tokio::test]
    async fn test_enter_starts_stopped_container() {
        let backend = Arc::new(MockBackend::new());
        backend.insert_instance(MockBackend::instance("test-enter", "Stopped"));
        backend.set_file("test-enter", "/etc/passwd", PASSWD);
        let service = service(backend.clone());

        service.prepare_enter(&creds(), "test-enter", &[]).await.unwrap();
        assert_eq!(backend.instances.lock()["test-enter"].status, "Running");
    }

    #[tokio::test]
    async fn test_enter_default_container_fallbacks() {
        let backend = Arc::new(MockBackend::new());
        running_container(&backend, "home-box", PASSWD, "ID=arch\n");

        let mut config = Configuration::default();
        config.default_container = "home-box".to_string();
        let service = ContainerService::new(backend.clone(), config, None);

        let args = service.prepare_enter(&creds(), "", &[]).await.unwrap();
        assert_eq!(args[2], "home-box");

        let unconfigured = ContainerService::new(backend, Configuration::default(), None);
        let err = unconfigured.prepare_enter(&creds(), "", &[]).await.unwrap_err();
        assert!(matches!(err, KapsuleError::ContainerNotFound(_)));
    }

    #[tokio::test]
    async fn test_enter_missing_container() {
        let service = service(Arc::new(MockBackend::new()));
        let err = service.prepare_enter(&creds(), "ghost", &[]).await.unwrap_err();
        assert!(matches!(err, KapsuleError::ContainerNotFound(_)));
    }
}
