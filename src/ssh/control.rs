//! OpenSSH Control-Channel Plumbing
//!
//! Everything that touches the installed `ssh` binary lives here: the
//! control-socket directory layout and the four control-mode invocations
//! (master spawn, liveness check, graceful exit, command execution).
//!
//! The crate never speaks the SSH protocol itself; it drives the client's
//! ControlMaster mode, so one authenticated session per target serves every
//! subsequent short-lived caller.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::target::{ConnectionId, Target};
use crate::config::Config;

/// Filesystem area holding one control socket per connection.
#[derive(Debug, Clone)]
pub struct ControlSocketStore {
    dir: PathBuf,
}

impl ControlSocketStore {
    pub fn new(config: &Config) -> Self {
        Self {
            dir: config.socket_dir.clone(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Socket path for a connection id: `<dir>/<id>.sock`.
    pub fn socket_path(&self, id: &ConnectionId) -> PathBuf {
        self.dir.join(format!("{}.sock", id))
    }

    /// Create the socket directory. Control sockets are private to the user.
    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700)).await?;
        }
        Ok(())
    }

    /// Whether a socket file is present. Presence says nothing about the
    /// owning master process; callers must probe before trusting it.
    pub fn socket_exists(&self, id: &ConnectionId) -> bool {
        self.socket_path(id).exists()
    }

    /// Age of the socket file since its last modification, if it exists and
    /// the filesystem reports timestamps.
    pub fn socket_age(&self, id: &ConnectionId) -> Option<Duration> {
        let meta = std::fs::metadata(self.socket_path(id)).ok()?;
        meta.modified().ok()?.elapsed().ok()
    }

    /// Remove a socket file. Returns whether a file was actually removed.
    pub async fn remove_socket(&self, id: &ConnectionId) -> std::io::Result<bool> {
        match tokio::fs::remove_file(self.socket_path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Enumerate `(connection_id, path)` for every `.sock` file present.
    pub fn list_sockets(&self) -> std::io::Result<Vec<(ConnectionId, PathBuf)>> {
        let mut sockets = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sockets),
            Err(e) => return Err(e),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sock") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                sockets.push((ConnectionId::from_raw(stem), path));
            }
        }
        Ok(sockets)
    }
}

fn quiet(cmd: &mut Command) {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
}

/// Spawn command for a persistent master session.
///
/// `-M -N -f`: master mode, no remote command, background after auth.
/// Host-key checking is disabled for unattended operation and BatchMode
/// keeps the client from ever prompting.
pub(crate) fn master_command(config: &Config, socket: &Path, target: &Target) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-M")
        .arg("-N")
        .arg("-f")
        .arg("-o")
        .arg(format!("ControlPath={}", socket.display()))
        .arg("-o")
        .arg(format!("ControlPersist={}", config.control_persist.as_secs()))
        .arg("-o")
        .arg(format!("ConnectTimeout={}", config.connect_timeout.as_secs()))
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg("-p")
        .arg(target.port.to_string())
        .arg(target.user_host());
    quiet(&mut cmd);
    cmd
}

/// `ssh -O check`: liveness probe against the control channel.
pub(crate) fn check_command(socket: &Path, target: &Target) -> Command {
    control_command("check", socket, &target.user_host())
}

/// `ssh -O exit`: ask the master to terminate gracefully.
pub(crate) fn exit_command(socket: &Path, target: &Target) -> Command {
    control_command("exit", socket, &target.user_host())
}

/// Probe a bare socket path with no known owning target.
///
/// `-O check` resolves the session purely through ControlPath; the
/// destination argument is required by the client but never contacted.
pub(crate) fn probe_command(socket: &Path) -> Command {
    control_command("check", socket, "unresolved-target")
}

fn control_command(op: &str, socket: &Path, destination: &str) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-O")
        .arg(op)
        .arg("-o")
        .arg(format!("ControlPath={}", socket.display()))
        .arg(destination);
    quiet(&mut cmd);
    cmd
}

/// Run a command over the established session.
///
/// Output is captured, not inherited; the caller receives it unchanged.
pub(crate) fn exec_command(socket: &Path, target: &Target, command: &str) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-o")
        .arg(format!("ControlPath={}", socket.display()))
        .arg("-o")
        .arg("BatchMode=yes")
        .arg("-p")
        .arg(target.port.to_string())
        .arg(target.user_host())
        .arg("--")
        .arg(command);
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.socket_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn test_socket_path_layout() {
        let config = test_config(Path::new("/tmp/hostmux-sockets"));
        let store = ControlSocketStore::new(&config);
        let id = ConnectionId::derive("root@web1");
        let path = store.socket_path(&id);
        assert!(path.starts_with("/tmp/hostmux-sockets"));
        assert_eq!(
            path.extension().and_then(|e| e.to_str()),
            Some("sock")
        );
    }

    #[tokio::test]
    async fn test_list_sockets_missing_dir_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(&temp.path().join("does-not-exist"));
        let store = ControlSocketStore::new(&config);
        assert!(store.list_sockets().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_socket_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        let store = ControlSocketStore::new(&config);
        store.ensure_dir().await.unwrap();

        let id = ConnectionId::derive("root@web1");
        assert!(!store.socket_exists(&id));
        assert!(!store.remove_socket(&id).await.unwrap());

        std::fs::write(store.socket_path(&id), b"").unwrap();
        assert!(store.socket_exists(&id));
        assert!(store.socket_age(&id).unwrap() < Duration::from_secs(60));

        let listed = store.list_sockets().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, id);

        assert!(store.remove_socket(&id).await.unwrap());
        assert!(!store.socket_exists(&id));
    }
}
