use std::cell::{Cell, RefCell};
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender};
use tracing::level_filters::LevelFilter;
use tracing::Level;

use crate::message::{emit, Envelope, EnvelopeKind, LogRecord, ToWorker};
use crate::pool::PoolCaller;

/// Handles messages on behalf of a [MessagePool](crate::MessagePool).
///
/// A worker is created on the thread it runs on, so it need not be `Send` itself.
pub trait PoolWorker {
    type Message: Send + 'static;
    type Reply: Send + 'static;

    fn start(&mut self, conn: &WorkerConnection<'_, Self::Reply>) -> anyhow::Result<()> {
        let _ = conn;
        Ok(())
    }

    fn handle(
        &mut self,
        message: Self::Message,
        conn: &WorkerConnection<'_, Self::Reply>,
    ) -> anyhow::Result<()>;

    /// Called once the worker is done, including after `start` or `handle` failed.
    fn stop(&mut self, conn: &WorkerConnection<'_, Self::Reply>) -> anyhow::Result<()> {
        let _ = conn;
        Ok(())
    }
}

/// What a worker is created with.
#[derive(Debug, Clone)]
pub struct WorkerInit<H> {
    pub number: usize,
    pub name: String,
    /// The pool's shared context. In parallel mode this is the worker's own copy, or
    /// `H::default()` if the context could not be serialized.
    pub host: H,
}

pub trait WorkerFactory<H>: Send + Sync + 'static {
    type Worker: PoolWorker;

    fn create(&self, init: WorkerInit<H>) -> Self::Worker;
}

impl<H, W, F> WorkerFactory<H> for F
where
    W: PoolWorker,
    F: Fn(WorkerInit<H>) -> W + Send + Sync + 'static,
{
    type Worker = W;

    fn create(&self, init: WorkerInit<H>) -> W {
        self(init)
    }
}

enum Sink<'a, R> {
    /// Replies go straight to the caller, on the caller's thread.
    Inline(RefCell<&'a mut dyn PoolCaller<R>>),
    Channel(Sender<Envelope<R>>),
}

/// A worker's handle back to its pool.
pub struct WorkerConnection<'a, R> {
    name: String,
    sink: Sink<'a, R>,
    max_level: LevelFilter,
    logs: RefCell<Vec<LogRecord>>,
    running: Cell<bool>,
}

impl<'a, R> WorkerConnection<'a, R> {
    pub(crate) fn inline(
        name: String,
        caller: &'a mut dyn PoolCaller<R>,
        max_level: LevelFilter,
    ) -> Self {
        Self::new(name, Sink::Inline(RefCell::new(caller)), max_level)
    }

    pub(crate) fn channel(
        name: String,
        to_manager: Sender<Envelope<R>>,
        max_level: LevelFilter,
    ) -> Self {
        Self::new(name, Sink::Channel(to_manager), max_level)
    }

    fn new(name: String, sink: Sink<'a, R>, max_level: LevelFilter) -> Self {
        Self {
            name,
            sink,
            max_level,
            logs: RefCell::new(Vec::new()),
            running: Cell::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends a reply to the pool's caller.
    pub fn post(&self, reply: R) {
        match &self.sink {
            Sink::Inline(caller) => caller.borrow_mut().handle(&self.name, reply),
            Sink::Channel(_) => self.send(EnvelopeKind::User(reply)),
        }
    }

    /// Logs on behalf of this worker, under [WORKER_LOG_TARGET](crate::WORKER_LOG_TARGET).
    /// In parallel mode the record travels with the next message the worker sends, so it is
    /// emitted in order with that message.
    #[track_caller]
    pub fn log(&self, level: Level, message: impl Into<String>) {
        if level > self.max_level {
            return;
        }
        let origin = Location::caller().file();
        match &self.sink {
            Sink::Inline(_) => emit(&self.name, origin, level, &message.into()),
            Sink::Channel(_) => self.logs.borrow_mut().push(LogRecord {
                level,
                message: message.into(),
                origin,
            }),
        }
    }

    /// Makes the worker stop once the message it is handling is done.
    pub fn stop_running(&self) {
        self.running.set(false);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.get()
    }

    pub(crate) fn send(&self, kind: EnvelopeKind<R>) {
        let Sink::Channel(to_manager) = &self.sink else {
            return;
        };
        let envelope = Envelope {
            src: self.name.clone(),
            kind,
            logs: std::mem::take(&mut *self.logs.borrow_mut()),
        };
        if to_manager.send(envelope).is_err() {
            tracing::debug!(worker = %self.name, "Pool is gone; dropping message");
        }
    }
}

/// Feeds messages to `worker` until told to stop. Does not call [PoolWorker::stop].
pub(crate) fn drive<W: PoolWorker>(
    worker: &mut W,
    to_worker: &Receiver<ToWorker<W::Message>>,
    conn: &WorkerConnection<'_, W::Reply>,
    cancel: &AtomicBool,
) -> anyhow::Result<()> {
    tracing::debug!(worker = %conn.name(), "starting");
    worker.start(conn)?;

    while conn.is_running() && !cancel.load(Ordering::SeqCst) {
        match to_worker.recv() {
            Ok(ToWorker::Work(message)) => worker.handle(message, conn)?,
            Ok(ToWorker::Stop) | Err(_) => break,
        }
    }

    tracing::debug!(worker = %conn.name(), "exiting");
    Ok(())
}

#[cfg(test)]
mod test {
    use tracing::level_filters::LevelFilter;
    use tracing::Level;

    use super::WorkerConnection;
    use crate::message::{EnvelopeKind, LogRecord};

    #[test]
    fn logs_below_max_level_are_not_buffered() {
        let (to_manager, from_worker) = crossbeam_channel::unbounded();
        let conn = WorkerConnection::channel("worker/3".into(), to_manager, LevelFilter::INFO);

        conn.log(Level::DEBUG, "noise");
        conn.log(Level::WARN, "disk almost full");
        conn.post(7u32);
        conn.post(8u32);

        let first = from_worker.recv().unwrap();
        assert_eq!(first.src, "worker/3");
        assert!(matches!(first.kind, EnvelopeKind::User(7)));
        assert_eq!(
            first.logs,
            vec![LogRecord {
                level: Level::WARN,
                message: "disk almost full".to_string(),
                origin: file!(),
            }]
        );

        let second = from_worker.recv().unwrap();
        assert!(second.logs.is_empty());
    }

    #[test]
    fn inline_posts_reach_the_caller_immediately() {
        let mut seen = vec![];
        let mut caller = |source: &str, reply: u32| seen.push((source.to_string(), reply));
        {
            let conn = WorkerConnection::<'_, u32>::inline(
                "worker/0".into(),
                &mut caller,
                LevelFilter::OFF,
            );
            conn.post(1);
            conn.log(Level::ERROR, "dropped by the filter");
            conn.post(2);
            assert!(conn.is_running());
            conn.stop_running();
            assert!(!conn.is_running());
        }
        assert_eq!(
            seen,
            vec![("worker/0".to_string(), 1), ("worker/0".to_string(), 2)]
        );
    }
}
