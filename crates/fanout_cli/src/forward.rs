use std::io;
use std::process::Command;

use anyhow::Context;
use fanout_forwarder::{ForwarderConfig, PortForwarder};
use fanout_utils::exit::ExitCode;

use crate::adb::AdbDevice;
use crate::args::ForwardArgs;

/// Set for the forwarding command, e.g. `8001:41234,8002:41235`.
pub const FORWARDED_PORTS_ENV: &str = "FANOUT_FORWARDED_PORTS";

pub fn forward(args: ForwardArgs, config: ForwarderConfig) -> anyhow::Result<ExitCode> {
    let device = AdbDevice::new(args.serial, args.adb);
    let forwarder = PortForwarder::open_system(config)?;

    let mapped = match forwarder.map(&device, &args.ports) {
        Ok(mapped) => mapped,
        Err(error) => {
            let host_log = forwarder.host_log().unwrap_or_default();
            tracing::error!(%error, %host_log, "Failed to forward ports");
            return Err(error.into());
        }
    };
    for (device_port, host_port) in &mapped {
        println!("{device_port} -> {host_port}");
    }

    let result = wait(&args.command, &format_ports(&mapped));
    forwarder
        .unmap_all_device_ports(&device)
        .context("failed to stop forwarding")?;
    result
}

fn format_ports(mapped: &[(u16, u16)]) -> String {
    mapped
        .iter()
        .map(|(device_port, host_port)| format!("{device_port}:{host_port}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Runs `command`, or without one waits for stdin to close.
fn wait(command: &[String], ports: &str) -> anyhow::Result<ExitCode> {
    let Some((program, args)) = command.split_first() else {
        eprintln!("Forwarding until stdin is closed.");
        io::copy(&mut io::stdin().lock(), &mut io::sink())?;
        return Ok(ExitCode::SUCCESS);
    };

    let status = Command::new(program)
        .args(args)
        .env(FORWARDED_PORTS_ENV, ports)
        .status()
        .with_context(|| format!("failed to run {program}"))?;
    Ok(ExitCode::from(status))
}
