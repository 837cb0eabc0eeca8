use std::any::Any;

use fanout_dispatch::thread_group::panic_message;
use thiserror::Error;
use tracing::Level;

use crate::pool::PoolError;

/// Returned (wrapped in an [anyhow::Error]) by a worker that was asked to give up, e.g. by the
/// user. Interrupts reach the caller as [PoolError::Interrupted] rather than as a generic worker
/// exception.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("interrupted")]
pub struct Interrupted;

/// Target of every log event a worker emits through its connection, so that
/// `FANOUT_LOG=fanout_pool::worker_log=debug` selects worker logs on their own.
pub const WORKER_LOG_TARGET: &str = "fanout_pool::worker_log";

/// A log event buffered by a worker, replayed by the pool alongside the message it came with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
    /// Source file of the worker code that logged the event.
    pub origin: &'static str,
}

impl LogRecord {
    /// Emits the record as coming from `worker`.
    pub(crate) fn replay(&self, worker: &str) {
        emit(worker, self.origin, self.level, &self.message);
    }
}

pub(crate) fn emit(worker: &str, origin: &str, level: Level, message: &str) {
    if level == Level::ERROR {
        tracing::error!(target: WORKER_LOG_TARGET, %worker, origin, "{message}");
    } else if level == Level::WARN {
        tracing::warn!(target: WORKER_LOG_TARGET, %worker, origin, "{message}");
    } else if level == Level::INFO {
        tracing::info!(target: WORKER_LOG_TARGET, %worker, origin, "{message}");
    } else if level == Level::DEBUG {
        tracing::debug!(target: WORKER_LOG_TARGET, %worker, origin, "{message}");
    } else {
        tracing::trace!(target: WORKER_LOG_TARGET, %worker, origin, "{message}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Interrupted,
    Error,
}

/// An error raised inside a worker, reduced to plain data so it can leave the worker's thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub kind: FailureKind,
    pub message: String,
    /// The chain of underlying causes, outermost first.
    pub causes: Vec<String>,
}

impl WorkerFailure {
    pub(crate) fn from_error(error: &anyhow::Error) -> Self {
        let kind = if error.is::<Interrupted>() {
            FailureKind::Interrupted
        } else {
            FailureKind::Error
        };
        Self {
            kind,
            message: error.to_string(),
            causes: error.chain().skip(1).map(ToString::to_string).collect(),
        }
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self {
            kind: FailureKind::Error,
            message: format!("panicked: {}", panic_message(payload)),
            causes: vec![],
        }
    }

    pub(crate) fn into_error(self, worker: String) -> PoolError {
        match self.kind {
            FailureKind::Interrupted => PoolError::Interrupted { worker },
            FailureKind::Error => PoolError::WorkerException {
                worker,
                message: self.message,
                causes: self.causes,
            },
        }
    }
}

pub(crate) enum EnvelopeKind<R> {
    /// A message the worker posted for the caller.
    User(R),
    Done,
    WorkerException(WorkerFailure),
}

/// Everything a worker sends to the pool travels in an envelope, together with the log records
/// the worker buffered since its last one.
pub(crate) struct Envelope<R> {
    pub src: String,
    pub kind: EnvelopeKind<R>,
    pub logs: Vec<LogRecord>,
}

pub(crate) enum ToWorker<M> {
    Work(M),
    Stop,
}

#[cfg(test)]
mod test {
    use anyhow::Context;

    use super::{FailureKind, Interrupted, WorkerFailure};

    #[test]
    fn failure_keeps_the_cause_chain() {
        let error = Err::<(), _>(std::io::Error::other("disk full"))
            .context("writing results")
            .unwrap_err();
        let failure = WorkerFailure::from_error(&error);
        assert_eq!(failure.kind, FailureKind::Error);
        assert_eq!(failure.message, "writing results");
        assert_eq!(failure.causes, vec!["disk full".to_string()]);
    }

    #[test]
    fn interrupts_are_recognized() {
        let failure = WorkerFailure::from_error(&anyhow::Error::new(Interrupted));
        assert_eq!(failure.kind, FailureKind::Interrupted);
    }

    #[test]
    fn panics_become_errors() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let failure = WorkerFailure::from_panic(payload.as_ref());
        assert_eq!(failure.kind, FailureKind::Error);
        assert_eq!(failure.message, "panicked: boom");
    }
}
