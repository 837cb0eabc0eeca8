use std::io;
use std::path::PathBuf;

use fanout_dispatch::worker::DeviceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("failed to use forwarder lock file {path}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to start host forwarder {path}; make sure it has been built")]
    HostDaemonMissing { path: PathBuf },
    #[error("failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {exit_code}:\n{output}")]
    HostDaemonFailed {
        program: String,
        exit_code: i32,
        output: String,
    },
    #[error("unexpected host forwarder output {output:?}, expected \"device_port:host_port\"")]
    UnexpectedOutput { output: String },
    #[error("failed to identify the current process group")]
    ProcessIdentity(#[source] io::Error),
    #[error(transparent)]
    Device(#[from] DeviceError),
}
