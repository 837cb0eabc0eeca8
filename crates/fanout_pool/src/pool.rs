use std::collections::HashSet;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use fanout_dispatch::thread_group::ThreadGroup;
use fanout_dispatch::watchdog::WatchdogTimer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::message::{Envelope, EnvelopeKind, FailureKind, Interrupted, ToWorker, WorkerFailure};
use crate::worker::{drive, PoolWorker, WorkerConnection, WorkerFactory, WorkerInit};

/// How long workers get to wind down once the pool closes, before they are abandoned.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("{worker} was interrupted")]
    Interrupted { worker: String },
    /// A parallel worker failed. Only the failure's text survives the trip back to the pool.
    #[error("{worker} raised: {message}")]
    WorkerException {
        worker: String,
        message: String,
        causes: Vec<String>,
    },
    /// The inline worker failed; the original error is kept.
    #[error(transparent)]
    Worker(anyhow::Error),
    #[error("failed to spawn {worker}")]
    Spawn {
        worker: String,
        #[source]
        source: io::Error,
    },
}

/// Receives what workers post.
pub trait PoolCaller<R> {
    fn handle(&mut self, source: &str, reply: R);
}

impl<R, F> PoolCaller<R> for F
where
    F: FnMut(&str, R),
{
    fn handle(&mut self, source: &str, reply: R) {
        self(source, reply)
    }
}

type Message<F, H> = <<F as WorkerFactory<H>>::Worker as PoolWorker>::Message;
type Reply<F, H> = <<F as WorkerFactory<H>>::Worker as PoolWorker>::Reply;

pub struct MessagePool<'c, C, F, H> {
    caller: &'c mut C,
    worker_factory: Arc<F>,
    num_workers: usize,
    host: H,
    stop_grace: Duration,
}

fn worker_name(number: usize) -> String {
    format!("worker/{number}")
}

impl<'c, C, F, H> MessagePool<'c, C, F, H>
where
    F: WorkerFactory<H>,
    C: PoolCaller<Reply<F, H>>,
    H: Serialize + DeserializeOwned + Default + Clone,
{
    /// A pool of `num_workers` workers built by `worker_factory`. One worker (or zero) runs
    /// inline; more run in parallel.
    pub fn new(caller: &'c mut C, worker_factory: F, num_workers: usize, host: H) -> Self {
        Self {
            caller,
            worker_factory: Arc::new(worker_factory),
            num_workers: num_workers.max(1),
            host,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }

    pub fn is_inline(&self) -> bool {
        self.num_workers == 1
    }

    /// Hands every message to some worker and returns once all workers are done, delivering
    /// their replies to the caller as they arrive.
    ///
    /// The first worker failure ends the run; the remaining workers are stopped.
    pub fn run(
        &mut self,
        messages: impl IntoIterator<Item = Message<F, H>>,
    ) -> Result<(), PoolError> {
        let (to_worker, from_pool) = crossbeam_channel::unbounded();
        for message in messages {
            // The pool holds a receiver, so sending cannot fail.
            let _ = to_worker.send(ToWorker::Work(message));
        }
        for _ in 0..self.num_workers {
            let _ = to_worker.send(ToWorker::Stop);
        }

        // Only log what the caller would see anyway.
        let max_level = LevelFilter::current();

        if self.is_inline() {
            self.run_inline(&from_pool, max_level)
        } else {
            self.run_parallel(to_worker, from_pool, max_level)
        }
    }

    fn run_inline(
        &mut self,
        from_pool: &Receiver<ToWorker<Message<F, H>>>,
        max_level: LevelFilter,
    ) -> Result<(), PoolError> {
        let name = worker_name(0);
        let mut worker = self.worker_factory.create(WorkerInit {
            number: 0,
            name: name.clone(),
            host: self.host.clone(),
        });

        let conn = WorkerConnection::inline(name.clone(), &mut *self.caller, max_level);
        let never = AtomicBool::new(false);
        let result = drive(&mut worker, from_pool, &conn, &never);
        let stopped = worker.stop(&conn);

        result.and(stopped).map_err(|error| {
            if error.is::<Interrupted>() {
                PoolError::Interrupted { worker: name }
            } else {
                PoolError::Worker(error)
            }
        })
    }

    fn run_parallel(
        &mut self,
        to_worker: Sender<ToWorker<Message<F, H>>>,
        from_pool: Receiver<ToWorker<Message<F, H>>>,
        max_level: LevelFilter,
    ) -> Result<(), PoolError> {
        let host = match serde_json::to_string(&self.host) {
            Ok(host) => Some(Arc::new(host)),
            Err(error) => {
                tracing::debug!(%error, "Pool context is not serializable; workers get a default");
                None
            }
        };

        let (to_manager, from_workers) = crossbeam_channel::unbounded();
        let cancel = Arc::new(AtomicBool::new(false));
        let mut group = ThreadGroup::new();

        for number in 0..self.num_workers {
            let name = worker_name(number);
            let spawned = group.spawn(name.clone(), {
                let worker_factory = Arc::clone(&self.worker_factory);
                let host = host.clone();
                let from_pool = from_pool.clone();
                let to_manager = to_manager.clone();
                let cancel = Arc::clone(&cancel);
                move || {
                    let init = WorkerInit {
                        number,
                        name: name.clone(),
                        host: copy_host::<H>(host.as_deref()),
                    };
                    let conn = WorkerConnection::channel(name, to_manager, max_level);
                    run_worker(&*worker_factory, init, &from_pool, &conn, &cancel);
                }
            });
            if let Err(source) = spawned {
                self.close(group, &cancel, to_worker);
                return Err(PoolError::Spawn {
                    worker: worker_name(number),
                    source,
                });
            }
        }
        drop(to_manager);
        drop(from_pool);

        let result = self.message_loop(&from_workers);
        self.close(group, &cancel, to_worker);
        result
    }

    /// Delivers worker messages until every worker is done, or one fails.
    fn message_loop(
        &mut self,
        from_workers: &Receiver<Envelope<Reply<F, H>>>,
    ) -> Result<(), PoolError> {
        let mut stopped = HashSet::new();
        while stopped.len() < self.num_workers {
            let Ok(Envelope { src, kind, logs }) = from_workers.recv() else {
                // Every worker hung up.
                break;
            };
            for record in logs {
                record.replay(&src);
            }
            match kind {
                EnvelopeKind::User(reply) => self.caller.handle(&src, reply),
                EnvelopeKind::Done => {
                    stopped.insert(src);
                }
                EnvelopeKind::WorkerException(failure) => return Err(failure.into_error(src)),
            }
        }
        Ok(())
    }

    /// Stops all workers. Workers still busy after the grace period are abandoned.
    fn close(
        &self,
        group: ThreadGroup<()>,
        cancel: &AtomicBool,
        to_worker: Sender<ToWorker<Message<F, H>>>,
    ) {
        cancel.store(true, Ordering::SeqCst);
        drop(to_worker);

        let joined = group.join_all(&WatchdogTimer::new(Some(self.stop_grace)));
        for (name, outcome) in joined.finished {
            if let Err(panic) = outcome {
                tracing::error!(worker = %name, %panic, "Worker thread panicked");
            }
        }
        if let Some(stall) = joined.stall {
            tracing::warn!(%stall, "Abandoning workers that did not stop");
        }
    }
}

fn copy_host<H: DeserializeOwned + Default>(serialized: Option<&String>) -> H {
    let Some(serialized) = serialized else {
        return H::default();
    };
    serde_json::from_str(serialized).unwrap_or_else(|error| {
        tracing::warn!(%error, "Failed to copy pool context; using a default");
        H::default()
    })
}

/// A parallel worker's whole life. Always ends with a `Done` message, preceded by a worker
/// exception if the worker failed.
fn run_worker<F, H>(
    worker_factory: &F,
    init: WorkerInit<H>,
    from_pool: &Receiver<ToWorker<Message<F, H>>>,
    conn: &WorkerConnection<'_, Reply<F, H>>,
    cancel: &AtomicBool,
) where
    F: WorkerFactory<H>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut worker = worker_factory.create(init);
        let result = drive(&mut worker, from_pool, conn, cancel);
        let stopped = worker.stop(conn);
        result.and(stopped)
    }));

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(WorkerFailure::from_error(&error)),
        Err(payload) => Some(WorkerFailure::from_panic(payload.as_ref())),
    };
    if let Some(failure) = failure {
        match failure.kind {
            FailureKind::Interrupted => {
                tracing::debug!(worker = %conn.name(), "interrupted, exiting");
            }
            FailureKind::Error => {
                tracing::error!(
                    worker = %conn.name(),
                    message = %failure.message,
                    causes = ?failure.causes,
                    "raised"
                );
            }
        }
        conn.send(EnvelopeKind::WorkerException(failure));
    }
    conn.send(EnvelopeKind::Done);
}
