use std::path::Path;

use fanout_dispatch::worker::DeviceError;

/// What the forwarder needs from a device to install and drive its device-side daemon.
pub trait ForwarderDevice {
    fn serial(&self) -> &str;

    fn file_exists(&self, device_path: &str) -> Result<bool, DeviceError>;

    /// Copies `host_path` (a file or directory) to `device_path`, skipping files that are already
    /// up to date.
    fn push_changed_files(&self, host_path: &Path, device_path: &str) -> Result<(), DeviceError>;

    /// Runs a shell command on the device with extra environment variables set. A non-zero exit
    /// is an error.
    fn run_shell_command(&self, command: &str, env: &[(&str, &str)])
        -> Result<String, DeviceError>;
}
