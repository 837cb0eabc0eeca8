//! Interfaces the dispatcher consumes. Running a test on a device is up to the implementor.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::results::ResultSet;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {serial} is unreachable")]
    Unreachable { serial: String },
    #[error("command failed on device {serial}: {message}")]
    CommandFailed { serial: String, message: String },
    #[error("command timed out on device {serial} after {after:?}")]
    CommandTimeout { serial: String, after: Duration },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeviceError {
    pub fn unreachable(serial: impl Into<String>) -> Self {
        Self::Unreachable {
            serial: serial.into(),
        }
    }

    /// Unreachable devices are expected in a pool; everything else is unexpected.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

/// Whether a test asked to be attempted again, and with what.
///
/// The retried test need not be the original one; a worker may narrow it down to only the
/// failing cases of a group, for example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    NoRetry,
    RetryWith(T),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRunOutcome<T> {
    pub results: ResultSet,
    pub retry: RetryOutcome<T>,
}

impl<T> TestRunOutcome<T> {
    pub fn finished(results: ResultSet) -> Self {
        Self {
            results,
            retry: RetryOutcome::NoRetry,
        }
    }

    pub fn retry_with(results: ResultSet, test: T) -> Self {
        Self {
            results,
            retry: RetryOutcome::RetryWith(test),
        }
    }
}

/// Runs tests on exactly one device.
///
/// Workers are created by the dispatcher's worker factory, one per device, and are set up and
/// torn down by the dispatcher.
pub trait TestWorker: Send + 'static {
    type Test;

    fn device_serial(&self) -> &str;

    /// Acquires whatever the worker needs on its device. Returning
    /// [DeviceError::Unreachable] drops the device from the run.
    fn set_up(&mut self) -> Result<(), DeviceError>;

    fn tear_down(&mut self) -> Result<(), DeviceError>;

    /// Cheap liveness probe, made before every test.
    fn is_online(&self) -> bool;

    /// Runs one test. `attempt` counts from 1 across the whole run, whichever worker made the
    /// earlier attempts. An `Err` means the device could not run the test at all; the test is
    /// put back for another worker, at the same attempt, and this worker stops.
    fn run_test(
        &mut self,
        test: &Self::Test,
        attempt: u32,
    ) -> Result<TestRunOutcome<Self::Test>, DeviceError>;
}

/// A unit of work the dispatcher can schedule.
pub trait DispatchTest: Clone + Send + Sync + fmt::Debug + 'static {
    /// Name used to report the test if it never gets to run.
    fn test_name(&self) -> String;

    /// Splits the test into pieces no larger than `max_per_run`. Opaque tests are not split.
    fn split_max_per_run(self, max_per_run: usize) -> Vec<Self> {
        let _ = max_per_run;
        vec![self]
    }
}

/// Tests named by strings may be colon-joined groups, e.g. `"Suite.a:Suite.b"`.
impl DispatchTest for String {
    fn test_name(&self) -> String {
        self.clone()
    }

    fn split_max_per_run(self, max_per_run: usize) -> Vec<Self> {
        let max_per_run = max_per_run.max(1);
        let parts: Vec<&str> = self.split(':').collect();
        if parts.len() <= max_per_run {
            return vec![self];
        }
        parts
            .chunks(max_per_run)
            .map(|chunk| chunk.join(":"))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::{DeviceError, DispatchTest};

    #[test]
    fn splits_colon_groups() {
        let groups = "x:y:z:w".to_string().split_max_per_run(2);
        assert_eq!(groups, vec!["x:y", "z:w"]);
    }

    #[test]
    fn uneven_split_keeps_remainder() {
        let groups = "a:b:c".to_string().split_max_per_run(2);
        assert_eq!(groups, vec!["a:b", "c"]);
    }

    #[test]
    fn small_groups_are_untouched() {
        let groups = "a:b".to_string().split_max_per_run(256);
        assert_eq!(groups, vec!["a:b"]);
    }

    #[test]
    fn unreachable_is_recognized() {
        assert!(DeviceError::unreachable("emulator-5554").is_unreachable());
        let other = DeviceError::CommandFailed {
            serial: "emulator-5554".to_string(),
            message: "exit 1".to_string(),
        };
        assert!(!other.is_unreachable());
    }
}
