//! The cross-process forwarder lock, and the host daemon owner record stored inside it.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::FileExt;

/// Identifies the process group that started the host daemon. The start time guards against the
/// group id having been reused since.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HostOwner {
    pub pgid: i32,
    pub start_time: u64,
}

impl HostOwner {
    pub fn current() -> io::Result<Self> {
        let pgid = nix::unistd::getpgrp().as_raw();
        let start_time = process_start_time(pgid)?;
        Ok(Self { pgid, start_time })
    }

    /// Whether the recorded group leader still runs, and is the same process that was recorded.
    pub fn is_alive(&self) -> bool {
        matches!(process_start_time(self.pgid), Ok(start_time) if start_time == self.start_time)
    }

    fn parse(record: &str) -> Option<Self> {
        let (pgid, start_time) = record.trim().split_once(':')?;
        Some(Self {
            pgid: pgid.parse().ok()?,
            start_time: start_time.parse().ok()?,
        })
    }
}

impl fmt::Display for HostOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pgid, self.start_time)
    }
}

/// Start time of a process, in clock ticks since boot.
fn process_start_time(pid: i32) -> io::Result<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))?;
    // The command name may contain spaces and parentheses; fields after it are well-formed.
    let after_comm = stat
        .rfind(')')
        .map(|i| &stat[i + 1..])
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed stat"))?;
    // starttime is field 22; fields after the command name start at field 3.
    after_comm
        .split_whitespace()
        .nth(22 - 3)
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing starttime"))
}

/// An exclusive `flock` on the lock file, released on drop.
pub(crate) struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.lock_exclusive()?;
        tracing::trace!(path = %path.display(), "Acquired forwarder lock");
        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_owner(&mut self) -> io::Result<Option<HostOwner>> {
        let mut record = String::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut record)?;
        Ok(HostOwner::parse(&record))
    }

    pub fn write_owner(&mut self, owner: HostOwner) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        write!(self.file, "{owner}")?;
        self.file.flush()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(error) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), %error, "Failed to release forwarder lock");
        }
    }
}
