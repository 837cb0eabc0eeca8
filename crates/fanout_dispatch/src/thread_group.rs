//! Named threads that are joined together under a [WatchdogTimer].

use std::any::Any;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::watchdog::WatchdogTimer;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("thread {name} panicked: {message}")]
pub struct ThreadPanic {
    pub name: String,
    pub message: String,
}

/// The watchdog fired before every thread in a group finished.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("no progress for {timeout:?}; abandoned threads {abandoned:?}")]
pub struct StallDetected {
    pub timeout: Duration,
    /// Names of the threads still running when the group stopped waiting on them.
    pub abandoned: Vec<String>,
}

#[derive(Debug)]
pub struct Joined<T> {
    /// Outcome of every thread that finished, in the order they were observed to finish.
    pub finished: Vec<(String, Result<T, ThreadPanic>)>,
    pub stall: Option<StallDetected>,
}

struct NamedThread<T> {
    name: String,
    handle: JoinHandle<T>,
}

/// A group of threads whose outcomes, panics included, are collected by the joining thread.
pub struct ThreadGroup<T> {
    threads: Vec<NamedThread<T>>,
}

impl<T> Default for ThreadGroup<T> {
    fn default() -> Self {
        Self {
            threads: Vec::new(),
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

impl<T: Send + 'static> ThreadGroup<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, f: F) -> io::Result<()>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new().name(name.clone()).spawn(f)?;
        self.threads.push(NamedThread { name, handle });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Waits for every thread to finish, or for the watchdog to fire.
    ///
    /// On a stall, threads that are still running are abandoned rather than interrupted: they
    /// keep running in the background and their results are never observed.
    pub fn join_all(self, watchdog: &WatchdogTimer) -> Joined<T> {
        let mut running = self.threads;
        let mut finished = Vec::with_capacity(running.len());

        loop {
            let mut still_running = Vec::with_capacity(running.len());
            for thread in running {
                if thread.handle.is_finished() {
                    let NamedThread { name, handle } = thread;
                    let outcome = handle.join().map_err(|payload| ThreadPanic {
                        name: name.clone(),
                        message: panic_message(payload.as_ref()),
                    });
                    finished.push((name, outcome));
                } else {
                    still_running.push(thread);
                }
            }
            running = still_running;

            if running.is_empty() {
                return Joined {
                    finished,
                    stall: None,
                };
            }

            if watchdog.is_timed_out() {
                let abandoned = running.into_iter().map(|t| t.name).collect();
                let stall = StallDetected {
                    timeout: watchdog.timeout().unwrap_or_default(),
                    abandoned,
                };
                return Joined {
                    finished,
                    stall: Some(stall),
                };
            }

            thread::sleep(JOIN_POLL_INTERVAL);
        }
    }
}
