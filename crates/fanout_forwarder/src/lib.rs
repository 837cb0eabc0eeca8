//! Bridges TCP ports between the host and attached devices through a host/device daemon pair.
//!
//! Any number of processes on one host may use the forwarder at once; they coordinate through an
//! exclusive `flock` on a fixed lock file, see [forwarder::PortForwarder].

pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod forwarder;
mod lock;

pub use config::ForwarderConfig;
pub use error::ForwarderError;
pub use forwarder::PortForwarder;
