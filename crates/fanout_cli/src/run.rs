use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fanout_dispatch::dispatcher::{run_tests, DispatchConfig};
use fanout_dispatch::worker::DeviceError;
use fanout_utils::exit::ExitCode;

use crate::args::RunArgs;
use crate::exec_worker::ExecWorker;
use crate::fanout_config::DispatchSection;

pub fn run(args: RunArgs, section: &DispatchSection) -> anyhow::Result<ExitCode> {
    let tests = match &args.tests_file {
        Some(path) => read_tests_file(path)?,
        None => args.tests.clone(),
    };
    let devices = if args.devices.is_empty() {
        local_devices(num_cpus::get())
    } else {
        args.devices.clone()
    };
    let config = dispatch_config(&args, section);

    let command = Arc::new(args.command);
    let worker_factory = move |serial: &String, _: usize| {
        Ok::<_, DeviceError>(ExecWorker::new(serial.clone(), command.to_vec()))
    };
    let outcome = run_tests(tests, worker_factory, &devices, &config)?;

    if let Some(stall) = &outcome.stall {
        eprintln!("{stall}");
    }
    let failure_logs = outcome.results.failure_logs();
    if !failure_logs.is_empty() {
        eprint!("{failure_logs}");
    }
    println!("{}", outcome.results.long_form());

    Ok(outcome.exit_code)
}

fn dispatch_config(args: &RunArgs, section: &DispatchSection) -> DispatchConfig {
    let mut config = section.to_dispatch_config();
    config.shard = config.shard && !args.replicate;
    if let Some(retries) = args.retries {
        config.num_retries = retries;
    }
    if let Some(max_per_run) = args.max_per_run {
        config.max_per_run = max_per_run;
    }
    if let Some(secs) = args.test_timeout {
        config.test_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    config
}

fn local_devices(count: usize) -> Vec<String> {
    (0..count.max(1)).map(|i| format!("local-{i}")).collect()
}

fn read_tests_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read tests file {}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToOwned::to_owned)
        .collect())
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use clap::Parser;
    use indoc::indoc;
    use tempfile::NamedTempFile;

    use super::{dispatch_config, local_devices, read_tests_file};
    use crate::args::{Cli, Command, RunArgs};
    use crate::fanout_config::DispatchSection;

    fn run_args(args: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(["fanout", "run"].iter().chain(args)).unwrap();
        match cli.command {
            Command::Run(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn flags_override_the_config_file() {
        let args = run_args(&[
            "--replicate",
            "--retries",
            "0",
            "--test-timeout",
            "0",
            "--",
            "true",
        ]);
        let section = DispatchSection {
            max_per_run: 8,
            ..Default::default()
        };

        let config = dispatch_config(&args, &section);
        assert!(!config.shard);
        assert_eq!(config.num_retries, 0);
        assert_eq!(config.max_per_run, 8);
        assert_eq!(config.test_timeout, None);
        assert_eq!(config.setup_timeout, Some(Duration::from_secs(420)));
    }

    #[test]
    fn config_file_applies_without_flags() {
        let args = run_args(&["--", "true"]);
        let section = DispatchSection {
            shard: false,
            num_retries: 4,
            ..Default::default()
        };

        let config = dispatch_config(&args, &section);
        assert!(!config.shard);
        assert_eq!(config.num_retries, 4);
    }

    #[test]
    fn tests_file_skips_comments_and_blanks() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            indoc! {"
                # smoke tests
                Suite.a:Suite.b

                  Suite.c
            "},
        )
        .unwrap();

        let tests = read_tests_file(file.path()).unwrap();
        assert_eq!(tests, vec!["Suite.a:Suite.b", "Suite.c"]);
    }

    #[test]
    fn at_least_one_local_device() {
        assert_eq!(local_devices(0), vec!["local-0"]);
        assert_eq!(local_devices(2), vec!["local-0", "local-1"]);
    }
}
