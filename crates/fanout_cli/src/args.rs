use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Fans tests out over devices.
///
/// The fanout cli
#[derive(Parser)]
#[clap(version)]
pub struct Cli {
    /// Config file to use instead of the one in the user's config directory.
    #[clap(long, global = true, env = "FANOUT_CONFIG")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Runs tests across devices.
    ///
    /// Each test is run by executing the given command on this host, with `FANOUT_TEST`,
    /// `FANOUT_DEVICE` and `FANOUT_ATTEMPT` set in its environment. An exit code of 0 passes the
    /// test; anything else fails it and requests a retry.
    #[clap(arg_required_else_help = true)]
    Run(RunArgs),
    /// Forwards device ports to host ports for as long as a command runs.
    ///
    /// Without a command, ports stay forwarded until stdin is closed.
    #[clap(arg_required_else_help = true)]
    Forward(ForwardArgs),
    /// Manages the fanout config file.
    #[clap(subcommand)]
    Config(ConfigCmd),
}

#[derive(Args)]
pub struct RunArgs {
    /// Serial of a device to run on. May be given multiple times.
    /// When not specified, one local pseudo-device is used per CPU.
    #[clap(long = "device", short = 'd')]
    pub devices: Vec<String>,

    /// Run every test on every device, instead of sharding tests across devices.
    #[clap(long)]
    pub replicate: bool,

    /// How many times a failing test is retried.
    #[clap(long)]
    pub retries: Option<u32>,

    /// Largest number of tests in one colon-joined test group.
    #[clap(long)]
    pub max_per_run: Option<usize>,

    /// Seconds to wait for progress from any device before giving up. 0 waits forever.
    #[clap(long)]
    pub test_timeout: Option<u64>,

    /// Test to run. May be given multiple times; `a:b` runs `a` and `b` as one group.
    #[clap(long = "test", short = 't', conflicts_with = "tests_file")]
    pub tests: Vec<String>,

    /// File listing one test per line. Blank lines and lines starting with `#` are skipped.
    #[clap(long)]
    pub tests_file: Option<PathBuf>,

    /// Command that runs a single test.
    #[clap(required = true, last = true)]
    pub command: Vec<String>,
}

#[derive(Args)]
pub struct ForwardArgs {
    /// Serial of the device, as reported by `adb devices`.
    #[clap(long, short = 's', required = true)]
    pub serial: String,

    /// Path to adb.
    #[clap(long, default_value = "adb", env = "FANOUT_ADB")]
    pub adb: PathBuf,

    /// Ports to forward, as `DEVICE_PORT:HOST_PORT`. A host port of 0 picks a free port.
    #[clap(long = "port", short = 'p', required = true, value_parser = parse_port_pair)]
    pub ports: Vec<(u16, u16)>,

    /// Command to run while the ports are forwarded.
    #[clap(last = true)]
    pub command: Vec<String>,
}

#[derive(Subcommand)]
pub enum ConfigCmd {
    /// Writes a config file holding the defaults.
    Init {
        /// Overwrite an existing config file.
        #[clap(long)]
        force: bool,
    },
    /// Prints the config in effect.
    Show,
}

pub(crate) fn parse_port_pair(s: &str) -> Result<(u16, u16), String> {
    let (device_port, host_port) = s
        .split_once(':')
        .ok_or_else(|| format!("expected DEVICE_PORT:HOST_PORT, got {s:?}"))?;
    let device_port = device_port
        .parse()
        .map_err(|e| format!("bad device port {device_port:?}: {e}"))?;
    let host_port = host_port
        .parse()
        .map_err(|e| format!("bad host port {host_port:?}: {e}"))?;
    Ok((device_port, host_port))
}
