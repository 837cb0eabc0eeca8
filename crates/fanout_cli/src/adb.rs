use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use fanout_dispatch::worker::DeviceError;
use fanout_forwarder::command::{CommandOutput, CommandRunner, SystemCommandRunner};
use fanout_forwarder::device::ForwarderDevice;

/// adb output meaning the device is not there to talk to.
const UNREACHABLE_MARKERS: [&str; 3] = ["not found", "device offline", "no devices/emulators"];

/// A device reached through `adb -s <serial>`.
pub struct AdbDevice<R = SystemCommandRunner> {
    serial: String,
    adb: PathBuf,
    runner: R,
}

impl AdbDevice {
    pub fn new(serial: String, adb: PathBuf) -> Self {
        Self::with_runner(serial, adb, SystemCommandRunner)
    }
}

impl<R: CommandRunner> AdbDevice<R> {
    pub fn with_runner(serial: String, adb: PathBuf, runner: R) -> Self {
        Self {
            serial,
            adb,
            runner,
        }
    }

    fn adb(&self, args: &[&str]) -> Result<String, DeviceError> {
        let mut full_args = vec!["-s".to_string(), self.serial.clone()];
        full_args.extend(args.iter().map(|arg| arg.to_string()));

        let out = self
            .runner
            .run(&self.adb, &full_args)
            .with_context(|| format!("failed to run {}", self.adb.display()))?;
        self.check(out, args)
    }

    fn check(&self, out: CommandOutput, args: &[&str]) -> Result<String, DeviceError> {
        if out.success() {
            return Ok(out.output);
        }
        if UNREACHABLE_MARKERS
            .iter()
            .any(|marker| out.output.contains(marker))
        {
            return Err(DeviceError::unreachable(&self.serial));
        }
        Err(DeviceError::CommandFailed {
            serial: self.serial.clone(),
            message: format!(
                "adb {} exited with {}: {}",
                args.join(" "),
                out.exit_code,
                out.output.trim()
            ),
        })
    }
}

/// Quotes `s` for the device shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

impl<R: CommandRunner> ForwarderDevice for AdbDevice<R> {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn file_exists(&self, device_path: &str) -> Result<bool, DeviceError> {
        let script = format!("test -e {} && echo yes || echo no", shell_quote(device_path));
        let output = self.adb(&["shell", &script])?;
        Ok(output.trim() == "yes")
    }

    fn push_changed_files(&self, host_path: &Path, device_path: &str) -> Result<(), DeviceError> {
        self.adb(&["shell", &format!("mkdir -p {}", shell_quote(device_path))])?;

        if !host_path.is_dir() {
            let host = host_path.to_string_lossy();
            self.adb(&["push", "--sync", &host, device_path])?;
            return Ok(());
        }

        let entries = fs::read_dir(host_path)
            .with_context(|| format!("failed to list {}", host_path.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to list {}", host_path.display()))?;
            let host = entry.path();
            let host = host.to_string_lossy();
            self.adb(&["push", "--sync", &host, device_path])?;
        }
        Ok(())
    }

    fn run_shell_command(
        &self,
        command: &str,
        env: &[(&str, &str)],
    ) -> Result<String, DeviceError> {
        let mut script: Vec<String> = env
            .iter()
            .map(|(key, value)| format!("{key}={}", shell_quote(value)))
            .collect();
        script.push(command.to_string());
        self.adb(&["shell", &script.join(" ")])
    }
}

#[cfg(test)]
mod test {
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use fanout_forwarder::command::{CommandOutput, CommandRunner};
    use fanout_forwarder::device::ForwarderDevice;

    use super::{shell_quote, AdbDevice};

    #[derive(Clone, Default)]
    struct FakeAdb {
        calls: Arc<Mutex<Vec<Vec<String>>>>,
        reply: Arc<Mutex<Option<CommandOutput>>>,
    }

    impl FakeAdb {
        fn reply_with(&self, exit_code: i32, output: &str) {
            *self.reply.lock().unwrap() = Some(CommandOutput {
                exit_code,
                output: output.to_string(),
            });
        }
    }

    impl CommandRunner for FakeAdb {
        fn run(&self, program: &Path, args: &[String]) -> io::Result<CommandOutput> {
            assert_eq!(program, Path::new("adb"));
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(self.reply.lock().unwrap().clone().unwrap_or(CommandOutput {
                exit_code: 0,
                output: String::new(),
            }))
        }
    }

    fn device(adb: &FakeAdb) -> AdbDevice<FakeAdb> {
        AdbDevice::with_runner("emulator-5554".to_string(), PathBuf::from("adb"), adb.clone())
    }

    #[test]
    fn quotes_for_the_shell() {
        assert_eq!(shell_quote("/data/local/tmp"), "'/data/local/tmp'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn shell_commands_carry_env() {
        let adb = FakeAdb::default();
        device(&adb)
            .run_shell_command("/d/device_forwarder --kill-server", &[("LD_LIBRARY_PATH", "/d")])
            .unwrap();

        let calls = adb.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            vec![
                "-s",
                "emulator-5554",
                "shell",
                "LD_LIBRARY_PATH='/d' /d/device_forwarder --kill-server"
            ]
        );
    }

    #[test]
    fn file_exists_reads_the_shell_answer() {
        let adb = FakeAdb::default();
        adb.reply_with(0, "yes\n");
        assert!(device(&adb).file_exists("/d/device_forwarder").unwrap());
        adb.reply_with(0, "no\n");
        assert!(!device(&adb).file_exists("/d/device_forwarder").unwrap());
    }

    #[test]
    fn missing_device_is_unreachable() {
        let adb = FakeAdb::default();
        adb.reply_with(1, "adb: device 'emulator-5554' not found\n");
        let err = device(&adb).file_exists("/d").unwrap_err();
        assert!(err.is_unreachable(), "{err:?}");
    }

    #[test]
    fn other_failures_name_the_command() {
        let adb = FakeAdb::default();
        adb.reply_with(2, "permission denied\n");
        let err = device(&adb).run_shell_command("ls /", &[]).unwrap_err();
        assert!(!err.is_unreachable());
        assert_eq!(
            err.to_string(),
            "command failed on device emulator-5554: adb shell ls / exited with 2: permission denied"
        );
    }

    #[test]
    fn pushes_each_entry_of_a_directory() {
        let dist = tempfile::tempdir().unwrap();
        std::fs::write(dist.path().join("device_forwarder"), "").unwrap();

        let adb = FakeAdb::default();
        device(&adb)
            .push_changed_files(dist.path(), "/data/local/tmp/forwarder")
            .unwrap();

        let calls = adb.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0][2..], ["shell", "mkdir -p '/data/local/tmp/forwarder'"]);
        let host = dist.path().join("device_forwarder");
        assert_eq!(
            calls[1][2..],
            [
                "push",
                "--sync",
                host.to_str().unwrap(),
                "/data/local/tmp/forwarder"
            ]
        );
    }
}
