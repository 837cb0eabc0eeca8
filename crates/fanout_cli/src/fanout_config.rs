use anyhow::{anyhow, Context};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use etcetera::{app_strategy, AppStrategy, AppStrategyArgs};
use fanout_dispatch::dispatcher::DispatchConfig;
use fanout_forwarder::ForwarderConfig;
use serde_derive::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct FanoutConfig {
    pub dispatch: DispatchSection,
    pub forwarder: ForwarderConfig,
}

/// The `[dispatch]` table. Timeouts are in seconds; 0 waits forever.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchSection {
    pub shard: bool,
    pub num_retries: u32,
    pub max_per_run: usize,
    pub test_timeout_secs: u64,
    pub setup_timeout_secs: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        let defaults = DispatchConfig::default();
        Self {
            shard: defaults.shard,
            num_retries: defaults.num_retries,
            max_per_run: defaults.max_per_run,
            test_timeout_secs: secs(defaults.test_timeout),
            setup_timeout_secs: secs(defaults.setup_timeout),
        }
    }
}

fn secs(timeout: Option<Duration>) -> u64 {
    timeout.map_or(0, |t| t.as_secs())
}

fn timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl DispatchSection {
    pub fn to_dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            shard: self.shard,
            test_timeout: timeout(self.test_timeout_secs),
            setup_timeout: timeout(self.setup_timeout_secs),
            num_retries: self.num_retries,
            max_per_run: self.max_per_run,
        }
    }
}

pub fn fanout_config_filepath() -> anyhow::Result<PathBuf> {
    let strategy = app_strategy::Unix::new(AppStrategyArgs {
        top_level_domain: "dev".to_string(),
        author: "fanout".to_string(),
        app_name: "fanout".to_string(),
    })?;
    let config_dir = strategy.config_dir();
    Ok(config_dir.join("config.toml"))
}

pub fn write_fanout_config(config: &FanoutConfig, path: &Path) -> anyhow::Result<()> {
    let config_dir = path
        .parent()
        .ok_or_else(|| anyhow!("fanout config file must have parent dir"))?;
    fs::create_dir_all(config_dir)?;
    let toml_str = toml::to_string(config)?;
    fs::write(path, toml_str)?;
    Ok(())
}

pub fn read_fanout_config(path: &Path) -> anyhow::Result<FanoutConfig> {
    let toml_str = fs::read_to_string(path)?;
    parse_fanout_config(&toml_str, path)
}

fn parse_fanout_config(toml_str: &str, path: &Path) -> anyhow::Result<FanoutConfig> {
    toml::from_str(toml_str).with_context(|| format!("invalid fanout config {}", path.display()))
}

/// Reads the config at `explicit`, which must exist, or else the one at the default location,
/// falling back to defaults if there is none.
pub fn load_fanout_config(explicit: Option<&Path>) -> anyhow::Result<(FanoutConfig, PathBuf)> {
    if let Some(path) = explicit {
        let config = read_fanout_config(path)
            .with_context(|| format!("failed to read fanout config {}", path.display()))?;
        return Ok((config, path.to_owned()));
    }

    let path = fanout_config_filepath()?;
    let toml_str = match fs::read_to_string(&path) {
        Ok(toml_str) => toml_str,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No fanout config; using defaults");
            return Ok((FanoutConfig::default(), path));
        }
        Err(e) => return Err(e.into()),
    };
    let config = parse_fanout_config(&toml_str, &path)?;
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use indoc::indoc;
    use tempfile::NamedTempFile;

    #[test]
    fn test_fanout_config_operations() {
        let tmp_config_file = NamedTempFile::new().expect("Failed to create temporary file");

        let mut config = FanoutConfig::default();
        config.dispatch.num_retries = 5;
        config.forwarder.util_wrapper = Some("valgrind".to_string());

        write_fanout_config(&config, tmp_config_file.path()).unwrap();
        let read_config = read_fanout_config(tmp_config_file.path()).unwrap();

        assert_eq!(read_config, config);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let toml_str = indoc! {r#"
            [dispatch]
            shard = false
            test_timeout_secs = 0

            [forwarder]
            host_daemon = "/opt/forwarder/host_forwarder"
        "#};
        let config: FanoutConfig = toml::from_str(toml_str).unwrap();

        let dispatch = config.dispatch.to_dispatch_config();
        assert!(!dispatch.shard);
        assert_eq!(dispatch.test_timeout, None);
        assert_eq!(dispatch.setup_timeout, Some(Duration::from_secs(420)));
        assert_eq!(dispatch.num_retries, 2);
        assert_eq!(dispatch.max_per_run, 256);

        assert_eq!(
            config.forwarder.host_daemon,
            PathBuf::from("/opt/forwarder/host_forwarder")
        );
        assert_eq!(config.forwarder.lock_path, ForwarderConfig::default().lock_path);
    }

    #[test]
    fn unknown_types_are_rejected() {
        let tmp_config_file = NamedTempFile::new().unwrap();
        fs::write(
            tmp_config_file.path(),
            indoc! {r#"
                [dispatch]
                num_retries = "lots"
            "#},
        )
        .unwrap();

        let err = read_fanout_config(tmp_config_file.path()).unwrap_err();
        assert!(err.to_string().starts_with("invalid fanout config"), "{err}");
    }

    #[test]
    fn explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(load_fanout_config(Some(&missing)).is_err());
    }

    #[test]
    fn explicit_config_is_read() {
        let tmp_config_file = NamedTempFile::new().unwrap();
        fs::write(tmp_config_file.path(), "[dispatch]\nmax_per_run = 10\n").unwrap();

        let (config, path) = load_fanout_config(Some(tmp_config_file.path())).unwrap();
        assert_eq!(config.dispatch.max_per_run, 10);
        assert_eq!(path, tmp_config_file.path());
    }
}
