mod adb;
mod args;
mod exec_worker;
mod fanout_config;
mod forward;
mod run;

use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;
use fanout_utils::exit::ExitCode;

use args::{Cli, Command, ConfigCmd};
use fanout_config::{
    fanout_config_filepath, load_fanout_config, write_fanout_config, FanoutConfig,
};

fn main() {
    let cli = Cli::parse();

    let exit_code = match fanout_main(cli) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("fanout: {error:?}");
            ExitCode::DISPATCH_ERROR
        }
    };
    std::process::exit(exit_code.get());
}

fn fanout_main(cli: Cli) -> anyhow::Result<ExitCode> {
    let _logging = fanout_utils::logging::init()?;

    match cli.command {
        Command::Run(args) => run::run(args, &load_config(cli.config)?.dispatch),
        Command::Forward(args) => forward::forward(args, load_config(cli.config)?.forwarder),
        Command::Config(ConfigCmd::Init { force }) => init_config(cli.config, force),
        Command::Config(ConfigCmd::Show) => {
            print!("{}", toml::to_string(&load_config(cli.config)?)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<FanoutConfig> {
    let (config, path) = load_fanout_config(explicit.as_deref())?;
    tracing::debug!(path = %path.display(), ?config, "Loaded config");
    Ok(config)
}

/// Writes the default config. Does not read the existing one, so a broken config can be reset.
fn init_config(explicit: Option<PathBuf>, force: bool) -> anyhow::Result<ExitCode> {
    let path = match explicit {
        Some(path) => path,
        None => fanout_config_filepath()?,
    };
    if path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        );
    }
    write_fanout_config(&FanoutConfig::default(), &path)?;
    println!("{}", path.display());
    Ok(ExitCode::SUCCESS)
}
