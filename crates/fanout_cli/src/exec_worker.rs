//! Runs each test as a host command.

use std::process::Command;

use anyhow::Context;
use fanout_dispatch::results::{ResultKind, ResultSet, TestResult};
use fanout_dispatch::worker::{DeviceError, TestRunOutcome, TestWorker};
use fanout_utils::exit::ExitCode;

pub const TEST_ENV: &str = "FANOUT_TEST";
pub const DEVICE_ENV: &str = "FANOUT_DEVICE";
/// 1 for the first attempt of a test, 2 for its first retry, and so on, counted across devices.
pub const ATTEMPT_ENV: &str = "FANOUT_ATTEMPT";

/// A worker that hands the test, and the device to run it on, to a user-provided command.
pub struct ExecWorker {
    serial: String,
    command: Vec<String>,
}

impl ExecWorker {
    pub fn new(serial: String, command: Vec<String>) -> Self {
        Self { serial, command }
    }
}

impl TestWorker for ExecWorker {
    type Test = String;

    fn device_serial(&self) -> &str {
        &self.serial
    }

    fn set_up(&mut self) -> Result<(), DeviceError> {
        if self.command.is_empty() {
            return Err(anyhow::anyhow!("no test command given").into());
        }
        Ok(())
    }

    fn tear_down(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn is_online(&self) -> bool {
        true
    }

    fn run_test(
        &mut self,
        test: &String,
        attempt: u32,
    ) -> Result<TestRunOutcome<String>, DeviceError> {
        let (program, args) = self
            .command
            .split_first()
            .context("no test command given")?;
        tracing::debug!(serial = %self.serial, %test, attempt, "Running test");
        let out = Command::new(program)
            .args(args)
            .env(TEST_ENV, test)
            .env(DEVICE_ENV, &self.serial)
            .env(ATTEMPT_ENV, attempt.to_string())
            .output()
            .with_context(|| format!("failed to run test command {program}"))?;

        let exit_code = ExitCode::from(out.status);
        if exit_code.is_success() {
            let results = ResultSet::from_iter([TestResult::new(test.as_str(), ResultKind::Pass)]);
            return Ok(TestRunOutcome::finished(results));
        }

        tracing::debug!(serial = %self.serial, %test, exit_code = exit_code.get(), "Test failed");
        let mut log = String::from_utf8_lossy(&out.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&out.stderr));
        let result = TestResult::new(test.as_str(), ResultKind::Fail).with_log(log);
        Ok(TestRunOutcome::retry_with(
            ResultSet::from_iter([result]),
            test.clone(),
        ))
    }
}

#[cfg(test)]
mod test {
    use fanout_dispatch::results::ResultKind;
    use fanout_dispatch::worker::{RetryOutcome, TestWorker};

    use super::ExecWorker;

    fn sh(script: &str) -> ExecWorker {
        ExecWorker::new(
            "emulator-5554".to_string(),
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        )
    }

    #[test]
    fn zero_exit_passes() {
        let mut worker = sh("exit 0");
        worker.set_up().unwrap();
        let outcome = worker.run_test(&"Suite.a".to_string(), 1).unwrap();

        assert_eq!(outcome.retry, RetryOutcome::NoRetry);
        let result = &outcome.results.all()[0];
        assert_eq!(result.name(), "Suite.a");
        assert_eq!(result.kind(), ResultKind::Pass);
    }

    #[test]
    fn failure_keeps_output_and_asks_for_retry() {
        let mut worker =
            sh(r#"echo "$FANOUT_TEST on $FANOUT_DEVICE, attempt $FANOUT_ATTEMPT"; exit 3"#);
        let test = "Suite.b".to_string();

        let first = worker.run_test(&test, 1).unwrap();
        assert_eq!(first.retry, RetryOutcome::RetryWith(test.clone()));
        let result = &first.results.all()[0];
        assert_eq!(result.kind(), ResultKind::Fail);
        assert_eq!(
            result.log(),
            Some("Suite.b on emulator-5554, attempt 1\n")
        );

        let second = worker.run_test(&test, 2).unwrap();
        assert_eq!(
            second.results.all()[0].log(),
            Some("Suite.b on emulator-5554, attempt 2\n")
        );
    }

    #[test]
    fn attempt_comes_from_the_caller() {
        // A retry may land on a device that never saw the earlier attempts.
        let mut worker = sh(r#"echo "$FANOUT_ATTEMPT"; exit 1"#);
        let third = worker.run_test(&"a".to_string(), 3).unwrap();
        assert_eq!(third.results.all()[0].log(), Some("3\n"));

        let first = worker.run_test(&"b".to_string(), 1).unwrap();
        assert_eq!(first.results.all()[0].log(), Some("1\n"));
    }

    #[test]
    fn missing_program_is_a_device_error() {
        let mut worker = ExecWorker::new(
            "local-0".to_string(),
            vec!["/definitely/not/a/test/runner".to_string()],
        );
        assert!(worker.run_test(&"a".to_string(), 1).is_err());
    }

    #[test]
    fn empty_command_fails_setup() {
        let mut worker = ExecWorker::new("local-0".to_string(), vec![]);
        assert!(worker.set_up().is_err());
    }
}
