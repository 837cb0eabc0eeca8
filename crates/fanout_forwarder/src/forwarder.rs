use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::command::{CommandOutput, CommandRunner, SystemCommandRunner};
use crate::config::ForwarderConfig;
use crate::device::ForwarderDevice;
use crate::error::ForwarderError;
use crate::lock::{HostOwner, LockFile};

/// `pkill` exits with 1 when no process matched.
const PKILL_NO_MATCH: i32 = 1;

/// Port maps of every forwarder in this process, by lock file.
static SHARED_MAPS: Mutex<BTreeMap<PathBuf, Arc<Mutex<PortMaps>>>> =
    parking_lot::const_mutex(BTreeMap::new());

#[derive(Default, Debug)]
struct PortMaps {
    device_to_host: HashMap<(String, u16), u16>,
    host_to_device: HashMap<u16, (String, u16)>,
    /// Devices whose daemon was started by this forwarder and not killed since.
    initialized_devices: HashSet<String>,
}

impl PortMaps {
    fn insert(&mut self, serial: &str, device_port: u16, host_port: u16) {
        self.device_to_host
            .insert((serial.to_owned(), device_port), host_port);
        self.host_to_device
            .insert(host_port, (serial.to_owned(), device_port));
    }

    fn remove(&mut self, serial: &str, device_port: u16) -> Option<u16> {
        let host_port = self
            .device_to_host
            .remove(&(serial.to_owned(), device_port))?;
        self.host_to_device.remove(&host_port);
        Some(host_port)
    }

    /// The maps shared by every forwarder in this process that uses `lock_path`.
    fn shared(lock_path: &Path) -> Arc<Mutex<PortMaps>> {
        let mut shared = SHARED_MAPS.lock();
        Arc::clone(shared.entry(lock_path.to_owned()).or_default())
    }

    fn device_ports(&self, serial: &str) -> Vec<u16> {
        let mut ports: Vec<_> = self
            .device_to_host
            .keys()
            .filter(|(s, _)| s == serial)
            .map(|(_, port)| *port)
            .collect();
        ports.sort_unstable();
        ports
    }
}

/// Forwards device ports to host ports.
///
/// One host daemon serves every process on the host, and one device daemon serves every process
/// using a device. All daemon state changes happen while holding an exclusive `flock` on the
/// configured lock file, so that independently launched processes (e.g. test shards) agree on
/// the daemons instead of each starting their own. Within a process, every forwarder using the
/// same lock file sees the same port maps, guarded by a mutex that is always taken before the
/// file lock.
pub struct PortForwarder<R = SystemCommandRunner> {
    config: ForwarderConfig,
    runner: R,
    maps: Arc<Mutex<PortMaps>>,
}

impl PortForwarder<SystemCommandRunner> {
    pub fn open_system(config: ForwarderConfig) -> Result<Self, ForwarderError> {
        Self::open(config, SystemCommandRunner)
    }
}

impl<R: CommandRunner> PortForwarder<R> {
    /// Makes sure the host daemon is running on behalf of this process group.
    ///
    /// If the lock file shows the daemon was started by this process group, or by another one
    /// whose leader is still running, nothing is done. Otherwise the owner is gone (or its id was
    /// reused), so any stale host daemon is killed and this process group is recorded as the
    /// owner; the daemon itself is started on demand by the first mapping.
    pub fn open(config: ForwarderConfig, runner: R) -> Result<Self, ForwarderError> {
        let forwarder = Self {
            maps: PortMaps::shared(&config.lock_path),
            config,
            runner,
        };
        let mut lock = forwarder.lock()?;
        forwarder.init_host_locked(&mut lock)?;
        Ok(forwarder)
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Forwards each `(device_port, host_port)` pair. A port of 0 lets the host daemon pick one;
    /// the returned pairs hold the ports actually used.
    ///
    /// If the host daemon fails to map a port, the device daemon is killed so it is not left
    /// half-configured.
    pub fn map<D>(
        &self,
        device: &D,
        port_pairs: &[(u16, u16)],
    ) -> Result<Vec<(u16, u16)>, ForwarderError>
    where
        D: ForwarderDevice + ?Sized,
    {
        let mut maps = self.maps.lock();
        let _lock = self.lock()?;
        self.init_device_locked(&mut maps, device)?;

        let serial = device.serial();
        let mut mapped = Vec::with_capacity(port_pairs.len());
        for &(device_port, host_port) in port_pairs {
            let args = vec![
                format!("--serial-id={serial}"),
                "--map".to_string(),
                device_port.to_string(),
                host_port.to_string(),
            ];
            let out = self.run_host_daemon(&args)?;
            if !out.success() {
                if let Err(error) = self.kill_device_locked(&mut maps, device) {
                    tracing::error!(%serial, %error, "Failed to kill device forwarder");
                }
                return Err(self.host_daemon_failed(out));
            }

            let (device_port, host_port) = parse_mapping(&out.output)?;
            maps.insert(serial, device_port, host_port);
            tracing::info!(%serial, device_port, host_port, "Forwarding device port to host port");
            mapped.push((device_port, host_port));
        }
        Ok(mapped)
    }

    /// Stops forwarding `device_port`. Unmapping a port that is not forwarded only logs an
    /// error. Once a device has no forwarded ports left, its daemon is killed.
    pub fn unmap_device_port<D>(&self, device_port: u16, device: &D) -> Result<(), ForwarderError>
    where
        D: ForwarderDevice + ?Sized,
    {
        let mut maps = self.maps.lock();
        let _lock = self.lock()?;
        self.unmap_device_port_locked(&mut maps, device_port, device.serial())?;

        let serial = device.serial();
        if maps.initialized_devices.contains(serial) && maps.device_ports(serial).is_empty() {
            self.kill_device_locked(&mut maps, device)?;
        }
        Ok(())
    }

    /// Stops forwarding every port of `device` and kills its daemon.
    pub fn unmap_all_device_ports<D>(&self, device: &D) -> Result<(), ForwarderError>
    where
        D: ForwarderDevice + ?Sized,
    {
        let mut maps = self.maps.lock();
        let serial = device.serial();
        if !maps.initialized_devices.contains(serial) {
            return Ok(());
        }

        let _lock = self.lock()?;
        for device_port in maps.device_ports(serial) {
            self.unmap_device_port_locked(&mut maps, device_port, serial)?;
        }
        self.kill_device_locked(&mut maps, device)
    }

    /// The device port forwarded to `host_port`, if any.
    pub fn device_port_for_host_port(&self, host_port: u16) -> Option<u16> {
        let maps = self.maps.lock();
        maps.host_to_device
            .get(&host_port)
            .map(|(_, device_port)| *device_port)
    }

    /// Contents of the host daemon's log, or an empty string if there is none.
    pub fn host_log(&self) -> io::Result<String> {
        match fs::read_to_string(&self.config.host_log) {
            Ok(log) => Ok(log),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    pub fn remove_host_log(&self) -> io::Result<()> {
        match fs::remove_file(&self.config.host_log) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn lock(&self) -> Result<LockFile, ForwarderError> {
        LockFile::acquire(&self.config.lock_path).map_err(|source| ForwarderError::Lock {
            path: self.config.lock_path.clone(),
            source,
        })
    }

    fn init_host_locked(&self, lock: &mut LockFile) -> Result<(), ForwarderError> {
        let path = lock.path().to_owned();
        let lock_error = |source| ForwarderError::Lock {
            path: path.clone(),
            source,
        };

        let current = HostOwner::current().map_err(ForwarderError::ProcessIdentity)?;
        let recorded = lock.read_owner().map_err(lock_error)?;
        match recorded {
            Some(owner) if owner == current => {
                tracing::debug!(%owner, "Host forwarder already owned by this process group");
                return Ok(());
            }
            Some(owner) if owner.is_alive() => {
                tracing::debug!(%owner, "Host forwarder owned by live process group");
                return Ok(());
            }
            _ => {}
        }

        tracing::info!(?recorded, owner = %current, "Taking over host forwarder");
        self.kill_host_locked()?;
        lock.write_owner(current).map_err(lock_error)
    }

    fn kill_host_locked(&self) -> Result<(), ForwarderError> {
        tracing::info!("Killing host forwarder");
        let out = self.run_host_daemon(&["--kill-server".to_string()])?;
        if out.success() {
            return Ok(());
        }

        tracing::warn!(
            exit_code = out.exit_code,
            output = %out.output,
            "Host forwarder did not stop; killing it"
        );
        let pkill = Path::new("pkill");
        let args = ["-9".to_string(), self.config.host_daemon_name()];
        let out = self
            .runner
            .run(pkill, &args)
            .map_err(|source| ForwarderError::Spawn {
                program: "pkill".to_string(),
                source,
            })?;
        if out.success() || out.exit_code == PKILL_NO_MATCH {
            Ok(())
        } else {
            Err(ForwarderError::HostDaemonFailed {
                program: "pkill".to_string(),
                exit_code: out.exit_code,
                output: out.output,
            })
        }
    }

    fn init_device_locked<D>(&self, maps: &mut PortMaps, device: &D) -> Result<(), ForwarderError>
    where
        D: ForwarderDevice + ?Sized,
    {
        let serial = device.serial();
        if maps.initialized_devices.contains(serial) {
            return Ok(());
        }

        self.kill_device_locked(maps, device)?;
        device.push_changed_files(&self.config.device_daemon_dist, &self.config.device_dir)?;
        let command = self.device_daemon_command(None);
        device.run_shell_command(&command, &self.device_env())?;

        tracing::info!(%serial, "Started device forwarder");
        maps.initialized_devices.insert(serial.to_owned());
        Ok(())
    }

    fn kill_device_locked<D>(&self, maps: &mut PortMaps, device: &D) -> Result<(), ForwarderError>
    where
        D: ForwarderDevice + ?Sized,
    {
        let serial = device.serial();
        tracing::info!(%serial, "Killing device forwarder");
        maps.initialized_devices.remove(serial);

        if !device.file_exists(&self.config.device_daemon_path())? {
            return Ok(());
        }
        let command = self.device_daemon_command(Some("--kill-server"));
        device.run_shell_command(&command, &self.device_env())?;
        Ok(())
    }

    fn unmap_device_port_locked(
        &self,
        maps: &mut PortMaps,
        device_port: u16,
        serial: &str,
    ) -> Result<(), ForwarderError> {
        if !maps.device_to_host.contains_key(&(serial.to_owned(), device_port)) {
            tracing::error!(%serial, device_port, "Trying to unmap non-forwarded port");
            return Ok(());
        }

        let args = vec![
            format!("--serial-id={serial}"),
            "--unmap".to_string(),
            device_port.to_string(),
        ];
        let out = self.run_host_daemon(&args)?;
        if !out.success() {
            let error = self.host_daemon_failed(out);
            tracing::error!(%serial, device_port, %error, "Failed to unmap device port");
        }

        maps.remove(serial, device_port);
        Ok(())
    }

    fn run_host_daemon(&self, args: &[String]) -> Result<CommandOutput, ForwarderError> {
        let path = &self.config.host_daemon;
        self.runner.run(path, args).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ForwarderError::HostDaemonMissing { path: path.clone() }
            } else {
                ForwarderError::Spawn {
                    program: path.display().to_string(),
                    source,
                }
            }
        })
    }

    fn host_daemon_failed(&self, out: CommandOutput) -> ForwarderError {
        ForwarderError::HostDaemonFailed {
            program: self.config.host_daemon.display().to_string(),
            exit_code: out.exit_code,
            output: out.output,
        }
    }

    fn device_daemon_command(&self, arg: Option<&str>) -> String {
        let daemon = self.config.device_daemon_path();
        let parts = [self.config.util_wrapper.as_deref(), Some(daemon.as_str()), arg];
        parts.into_iter().flatten().collect::<Vec<_>>().join(" ")
    }

    fn device_env(&self) -> [(&str, &str); 1] {
        [("LD_LIBRARY_PATH", self.config.device_dir.as_str())]
    }
}

/// Parses the host daemon's `device_port:host_port` reply to `--map`.
fn parse_mapping(output: &str) -> Result<(u16, u16), ForwarderError> {
    let unexpected = || ForwarderError::UnexpectedOutput {
        output: output.to_owned(),
    };
    let (device_port, host_port) = output.trim().split_once(':').ok_or_else(unexpected)?;
    let device_port = device_port.parse().map_err(|_| unexpected())?;
    let host_port = host_port.parse().map_err(|_| unexpected())?;
    Ok((device_port, host_port))
}
