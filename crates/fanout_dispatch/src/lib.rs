//! Fans a list of tests out over a pool of device-bound workers.
//!
//! See [dispatcher::run_tests] for the entry point.

pub mod dispatcher;
pub mod results;
pub mod thread_group;
pub mod watchdog;
pub mod work_queue;
pub mod worker;

/// Default timeout for both the test phase watchdog and worker setup/teardown.
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(7 * 60);
