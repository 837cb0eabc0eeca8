//! An actor-style worker pool.
//!
//! A [MessagePool] hands messages to workers and routes whatever the workers post back to a
//! [PoolCaller]. With one worker, everything runs inline on the calling thread; with more, each
//! worker runs on its own thread and talks to the pool over channels.

mod message;
mod pool;
mod worker;

pub use message::{FailureKind, Interrupted, LogRecord, WorkerFailure, WORKER_LOG_TARGET};
pub use pool::{MessagePool, PoolCaller, PoolError, DEFAULT_STOP_GRACE};
pub use worker::{PoolWorker, WorkerConnection, WorkerFactory, WorkerInit};
