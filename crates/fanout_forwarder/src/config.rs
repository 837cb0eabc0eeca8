use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_LOCK_PATH: &str = "/tmp/fanout.forwarder.lock";
pub const DEFAULT_HOST_LOG: &str = "/tmp/host_forwarder_log";
pub const DEFAULT_DEVICE_DIR: &str = "/data/local/tmp/forwarder";
pub const DEVICE_DAEMON_NAME: &str = "device_forwarder";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ForwarderConfig {
    /// File every forwarder process on this host locks before touching daemon state. It also
    /// records which process group started the host daemon.
    pub lock_path: PathBuf,
    /// The host-side daemon executable.
    pub host_daemon: PathBuf,
    /// Host directory holding the device-side daemon and its libraries.
    pub device_daemon_dist: PathBuf,
    /// Directory on the device the daemon is pushed to and run from.
    pub device_dir: String,
    /// Log file written by the host daemon.
    pub host_log: PathBuf,
    /// Prefix for device-side daemon commands, e.g. a memory checker.
    pub util_wrapper: Option<String>,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            host_daemon: PathBuf::from("host_forwarder"),
            device_daemon_dist: PathBuf::from("forwarder_dist"),
            device_dir: DEFAULT_DEVICE_DIR.to_string(),
            host_log: PathBuf::from(DEFAULT_HOST_LOG),
            util_wrapper: None,
        }
    }
}

impl ForwarderConfig {
    pub fn device_daemon_path(&self) -> String {
        format!(
            "{}/{DEVICE_DAEMON_NAME}",
            self.device_dir.trim_end_matches('/')
        )
    }

    /// Name the host daemon shows up as in the process table.
    pub(crate) fn host_daemon_name(&self) -> String {
        self.host_daemon
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.host_daemon.display().to_string())
    }
}
