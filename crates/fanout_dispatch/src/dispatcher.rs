use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fanout_utils::exit::ExitCode;
use parking_lot::Mutex;
use thiserror::Error;

use crate::results::{ResultKind, ResultSet, TestResult};
use crate::thread_group::{panic_message, StallDetected, ThreadGroup, ThreadPanic};
use crate::watchdog::WatchdogTimer;
use crate::work_queue::{WorkItem, WorkQueue};
use crate::worker::{DeviceError, DispatchTest, RetryOutcome, TestWorker};
use crate::DEFAULT_TIMEOUT;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Shard tests across devices (each test runs once), or replicate them (every device runs
    /// every test).
    pub shard: bool,
    /// Watchdog timeout for the test phase. `None` waits forever.
    pub test_timeout: Option<Duration>,
    /// Timeout for setting up and tearing down all workers.
    pub setup_timeout: Option<Duration>,
    /// How many times a test that requested a retry is retried.
    pub num_retries: u32,
    /// Upper bound on the size of a colon-joined test group.
    pub max_per_run: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            shard: true,
            test_timeout: Some(DEFAULT_TIMEOUT),
            setup_timeout: Some(DEFAULT_TIMEOUT),
            num_retries: 2,
            max_per_run: 256,
        }
    }
}

#[derive(Debug)]
#[must_use]
pub struct DispatchOutcome {
    pub results: ResultSet,
    pub exit_code: ExitCode,
    /// Set if the test phase stopped waiting on workers that made no progress.
    pub stall: Option<StallDetected>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no devices available: all {attempted} devices failed to set up")]
    NoDevicesAvailable { attempted: usize },
    #[error("failed to set up a worker for device {device}")]
    SetUp {
        device: String,
        #[source]
        source: DeviceError,
    },
    #[error("worker setup panicked")]
    SetUpPanicked(#[source] ThreadPanic),
}

/// A worker that finished setup, shared between its run thread and teardown.
struct DeviceWorker<W> {
    serial: String,
    worker: Arc<Mutex<W>>,
}

struct SetUpFailure {
    device: String,
    error: DeviceError,
}

/// Splits string test groups larger than `max_per_run` into sequential sub-groups.
pub fn apply_max_per_run<T: DispatchTest>(tests: Vec<T>, max_per_run: usize) -> Vec<T> {
    tests
        .into_iter()
        .flat_map(|test| test.split_max_per_run(max_per_run))
        .collect()
}

/// Runs `tests` on workers created for each of `devices`.
///
/// Devices that turn out to be unreachable while setting up are dropped from the run. Tests that
/// no device managed to run are reported as [ResultKind::Unknown]. The returned exit code is
/// [ExitCode::TESTS_FAILED] if any result is failing, and [ExitCode::DISPATCH_ERROR] if there was
/// nothing to run.
///
/// If the test watchdog fires, workers still running a test are abandoned, not interrupted:
/// their threads keep running in the background and the tests they were running are reported as
/// [ResultKind::Timeout]. No further tests are started, and a worker still running a test is not
/// torn down.
pub fn run_tests<T, D, W, F>(
    tests: Vec<T>,
    worker_factory: F,
    devices: &[D],
    config: &DispatchConfig,
) -> Result<DispatchOutcome, DispatchError>
where
    T: DispatchTest,
    D: fmt::Display + Clone + Send + 'static,
    W: TestWorker<Test = T>,
    F: Fn(&D, usize) -> Result<W, DeviceError> + Send + Sync + 'static,
{
    if tests.is_empty() {
        tracing::error!("No tests to run.");
        return Ok(DispatchOutcome {
            results: ResultSet::new(),
            exit_code: ExitCode::DISPATCH_ERROR,
            stall: None,
        });
    }

    let tests = apply_max_per_run(tests, config.max_per_run);
    let mode = if config.shard {
        "sharded across devices"
    } else {
        "replicated on each device"
    };
    tracing::info!(num_tests = tests.len(), mode, ?tests, "Will run tests");

    let workers = create_workers(worker_factory, devices, config.setup_timeout)?;
    let outcome = run_all_tests(&workers, tests, config);
    tear_down_workers(workers, config.setup_timeout);

    Ok(outcome)
}

fn create_workers<D, W, F>(
    worker_factory: F,
    devices: &[D],
    setup_timeout: Option<Duration>,
) -> Result<Vec<DeviceWorker<W>>, DispatchError>
where
    D: fmt::Display + Clone + Send + 'static,
    W: TestWorker,
    F: Fn(&D, usize) -> Result<W, DeviceError> + Send + Sync + 'static,
{
    tracing::info!("Creating {} test workers", devices.len());

    let worker_factory = Arc::new(worker_factory);
    let created: Arc<Mutex<Vec<(usize, DeviceWorker<W>)>>> = Default::default();
    let shard_counter = Arc::new(AtomicUsize::new(0));

    let mut group = ThreadGroup::new();
    for device in devices {
        let device = device.clone();
        let worker_factory = Arc::clone(&worker_factory);
        let created = Arc::clone(&created);
        let shard_counter = Arc::clone(&shard_counter);

        let name = format!("setup-{device}");
        let spawned = group.spawn(name, move || {
            let shard_index = shard_counter.fetch_add(1, Ordering::SeqCst);
            tracing::info!(shard_index, %device, "Creating shard");

            let set_up = || -> Result<W, DeviceError> {
                let mut worker = worker_factory(&device, shard_index)?;
                worker.set_up()?;
                Ok(worker)
            };
            match set_up() {
                Ok(worker) => {
                    let serial = worker.device_serial().to_owned();
                    let worker = Arc::new(Mutex::new(worker));
                    created
                        .lock()
                        .push((shard_index, DeviceWorker { serial, worker }));
                    Ok(())
                }
                Err(error) => Err(SetUpFailure {
                    device: device.to_string(),
                    error,
                }),
            }
        });
        if let Err(error) = spawned {
            tracing::error!(%error, "Failed to spawn setup thread");
        }
    }

    let joined = group.join_all(&WatchdogTimer::new(setup_timeout));
    if let Some(stall) = &joined.stall {
        tracing::error!(
            %stall,
            "Timed out setting up workers; continuing with those that are ready"
        );
    }

    let mut fatal = None;
    for (_, outcome) in joined.finished {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(SetUpFailure { device, error })) if error.is_unreachable() => {
                tracing::warn!(%device, %error, "Failed to create shard for device");
            }
            Ok(Err(SetUpFailure { device, error })) => {
                tracing::error!(%device, %error, "Unexpected error setting up device");
                fatal.get_or_insert(DispatchError::SetUp {
                    device,
                    source: error,
                });
            }
            Err(panic) => {
                tracing::error!(%panic, "Worker setup panicked");
                fatal.get_or_insert(DispatchError::SetUpPanicked(panic));
            }
        }
    }

    let mut created = std::mem::take(&mut *created.lock());
    created.sort_by_key(|(shard_index, _)| *shard_index);
    let workers: Vec<_> = created.into_iter().map(|(_, worker)| worker).collect();

    if let Some(error) = fatal {
        tear_down_workers(workers, setup_timeout);
        return Err(error);
    }
    if workers.is_empty() {
        return Err(DispatchError::NoDevicesAvailable {
            attempted: devices.len(),
        });
    }

    Ok(workers)
}

fn run_all_tests<T, W>(
    workers: &[DeviceWorker<W>],
    tests: Vec<T>,
    config: &DispatchConfig,
) -> DispatchOutcome
where
    T: DispatchTest,
    W: TestWorker<Test = T>,
{
    tracing::info!("Running tests with {} test workers", workers.len());

    let watchdog = Arc::new(WatchdogTimer::new(config.test_timeout));
    let results_sink: Arc<Mutex<Vec<ResultSet>>> = Default::default();

    // In sharded mode every worker draws from the same queue, so only the first one is distinct.
    let queues: Vec<Arc<WorkQueue<T>>> = if config.shard {
        let shared = Arc::new(WorkQueue::new(tests));
        vec![shared; workers.len()]
    } else {
        let template = WorkQueue::new(tests);
        workers
            .iter()
            .map(|_| Arc::new(template.replicate()))
            .collect()
    };
    let distinct_queues = if config.shard { 1 } else { queues.len() };

    let current_tests: Vec<Arc<Mutex<Option<T>>>> =
        workers.iter().map(|_| Default::default()).collect();

    let mut group = ThreadGroup::new();
    for ((worker, queue), current_test) in workers.iter().zip(&queues).zip(&current_tests) {
        let run_loop = RunLoop {
            serial: worker.serial.clone(),
            worker: Arc::clone(&worker.worker),
            queue: Arc::clone(queue),
            current_test: Arc::clone(current_test),
            results_sink: Arc::clone(&results_sink),
            watchdog: Arc::clone(&watchdog),
            num_retries: config.num_retries,
            tag_results: !config.shard,
        };
        if let Err(error) = group.spawn(format!("run-{}", worker.serial), move || run_loop.run()) {
            tracing::error!(serial = %worker.serial, %error, "Failed to spawn test thread");
        }
    }

    let joined = group.join_all(&watchdog);
    for (thread, outcome) in joined.finished {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) if error.is_unreachable() => {
                tracing::warn!(%thread, %error, "Device went offline");
            }
            Ok(Err(error)) => {
                tracing::error!(%thread, %error, "Test worker stopped on an unexpected error");
            }
            Err(panic) => {
                tracing::error!(%panic, "Test worker panicked");
            }
        }
    }
    let mut results = ResultSet::new();
    if let Some(stall) = &joined.stall {
        tracing::error!(%stall, "Watchdog fired; reporting partial results");
        for queue in &queues {
            queue.close();
        }
        // Tests still running on abandoned workers are reported as timed out.
        for (worker, current_test) in workers.iter().zip(&current_tests) {
            let Some(test) = current_test.lock().clone() else {
                continue;
            };
            let timed_out = TestResult::new(test.test_name(), ResultKind::Timeout);
            if config.shard {
                results.add_result(timed_out);
            } else {
                results.add_result(timed_out.tagged(&worker.serial));
            }
        }
    }

    for partial in std::mem::take(&mut *results_sink.lock()) {
        results.merge(partial);
    }

    let leftover = workers
        .iter()
        .zip(&queues)
        .take(distinct_queues)
        .filter(|(_, queue)| !queue.is_empty());
    let mut reported_leftover = false;
    for (worker, queue) in leftover {
        if !reported_leftover {
            tracing::error!(
                "Only ran {} tests (all devices are likely offline).",
                results.len()
            );
            reported_leftover = true;
        }
        let unknown = queue
            .pending_tests()
            .into_iter()
            .map(|test| TestResult::new(test.test_name(), ResultKind::Unknown));
        if config.shard {
            results.add_results(unknown);
        } else {
            results.add_results(unknown.map(|result| result.tagged(&worker.serial)));
        }
    }

    let exit_code = if results.did_run_pass() {
        ExitCode::SUCCESS
    } else {
        ExitCode::TESTS_FAILED
    };

    DispatchOutcome {
        results,
        exit_code,
        stall: joined.stall,
    }
}

fn tear_down_workers<W: TestWorker>(workers: Vec<DeviceWorker<W>>, timeout: Option<Duration>) {
    if workers.is_empty() {
        return;
    }
    tracing::info!("Tearing down {} test workers", workers.len());

    let mut group = ThreadGroup::new();
    for DeviceWorker { serial, worker } in workers {
        let name = format!("teardown-{serial}");
        // A worker abandoned mid-test still holds its lock.
        let spawned = group.spawn(name, move || {
            let result = worker.try_lock().map(|mut worker| worker.tear_down());
            (serial, result)
        });
        if let Err(error) = spawned {
            tracing::error!(%error, "Failed to spawn teardown thread");
        }
    }

    let joined = group.join_all(&WatchdogTimer::new(timeout));
    for (_, outcome) in joined.finished {
        match outcome {
            Ok((_, Some(Ok(())))) => {}
            Ok((serial, None)) => {
                tracing::warn!(%serial, "Skipping teardown of worker still running a test");
            }
            Ok((serial, Some(Err(error)))) if error.is_unreachable() => {
                tracing::warn!(%serial, %error, "Device unresponsive during teardown");
            }
            Ok((serial, Some(Err(error)))) => {
                tracing::error!(%serial, %error, "Unexpected error during teardown");
            }
            Err(panic) => {
                tracing::error!(%panic, "Teardown panicked");
            }
        }
    }
    if let Some(stall) = joined.stall {
        tracing::error!(%stall, "Timed out tearing down workers");
    }
}

/// What happened to one item taken off a queue.
enum StepOutcome<T> {
    Finalized(ResultSet),
    Retry {
        passing: ResultSet,
        item: WorkItem<T>,
    },
    Fatal(DeviceError),
    /// The run was stopped before the test started.
    Stopped,
}

/// The per-worker loop: draw tests off a queue until it is drained or the device fails.
struct RunLoop<T, W> {
    serial: String,
    worker: Arc<Mutex<W>>,
    queue: Arc<WorkQueue<T>>,
    /// The test this loop is running right now, if any.
    current_test: Arc<Mutex<Option<T>>>,
    results_sink: Arc<Mutex<Vec<ResultSet>>>,
    watchdog: Arc<WatchdogTimer>,
    num_retries: u32,
    tag_results: bool,
}

impl<T, W> RunLoop<T, W>
where
    T: DispatchTest,
    W: TestWorker<Test = T>,
{
    fn run(self) -> Result<(), DeviceError> {
        while let Some(item) = self.queue.wait_next() {
            self.watchdog.reset();

            *self.current_test.lock() = Some(item.test.clone());
            let step = self.attempt(&item);
            *self.current_test.lock() = None;
            let result = match step {
                StepOutcome::Finalized(results) => {
                    self.record(results);
                    Ok(())
                }
                StepOutcome::Retry {
                    passing,
                    item: retry,
                } => {
                    self.record(passing);
                    tracing::warn!(test = ?retry.test, tries = retry.tries, "Will retry test");
                    self.queue.add(retry);
                    Ok(())
                }
                StepOutcome::Fatal(error) => {
                    // Put the test back so another device may pick it up.
                    self.queue.add(item);
                    Err(error)
                }
                StepOutcome::Stopped => {
                    self.queue.add(item);
                    Ok(())
                }
            };

            // Retries are queued as separate items, so the removed item is always done with.
            self.queue.test_completed();
            result?;
        }
        Ok(())
    }

    fn attempt(&self, item: &WorkItem<T>) -> StepOutcome<T> {
        let tries = item.tries + 1;
        let run = {
            let mut worker = self.worker.lock();
            // Checked under the worker lock, which teardown also takes.
            if self.queue.is_closed() {
                return StepOutcome::Stopped;
            }
            if !worker.is_online() {
                return StepOutcome::Fatal(DeviceError::unreachable(&self.serial));
            }
            panic::catch_unwind(AssertUnwindSafe(|| worker.run_test(&item.test, tries)))
        };

        let outcome = match run {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(error)) => return StepOutcome::Fatal(error),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                return StepOutcome::Fatal(DeviceError::Other(anyhow::anyhow!(
                    "test {:?} panicked on {}: {message}",
                    item.test,
                    self.serial
                )));
            }
        };

        let results = if self.tag_results {
            outcome.results.tagged(&self.serial)
        } else {
            outcome.results
        };

        match outcome.retry {
            RetryOutcome::RetryWith(test) if tries <= self.num_retries => StepOutcome::Retry {
                passing: results.into_passing(),
                item: WorkItem::with_tries(test, tries),
            },
            _ => StepOutcome::Finalized(results),
        }
    }

    fn record(&self, results: ResultSet) {
        if !results.is_empty() {
            self.results_sink.lock().push(results);
        }
    }
}
