//! Configuration loading and tracing setup.
//!
//! Keeps command-line overrides and logging setup out of the main control flow.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use stagecoach_core::InstallerConfig;

use super::Args;

pub(super) fn load_config(args: &Args) -> Result<InstallerConfig> {
    let mut config = InstallerConfig::load_from_path(&args.config)
        .with_context(|| format!("read config from {}", args.config.display()))?;
    apply_overrides(&mut config, args);
    Ok(config)
}

fn apply_overrides(config: &mut InstallerConfig, args: &Args) {
    if let Some(state_file) = args.state_file.as_ref() {
        config.state_file = state_file.clone();
    }
    if args.offline {
        config.offline = true;
    }
}

pub(super) fn init_tracing(config: &InstallerConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            config
                .log_level
                .clone()
                .unwrap_or_else(|| "info".to_string()),
        )
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;

    #[test]
    fn flags_override_config_values() {
        let args = Args::parse_from([
            "stagecoach",
            "--state-file",
            "/tmp/state.json",
            "--offline",
        ]);
        let mut config = InstallerConfig::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.state_file, std::path::Path::new("/tmp/state.json"));
        assert!(config.offline);

        let args = Args::parse_from(["stagecoach"]);
        let mut config = InstallerConfig::default();
        apply_overrides(&mut config, &args);
        assert_eq!(
            config.state_file,
            std::path::Path::new("genconf/install_state.json")
        );
        assert!(!config.offline);
    }
}
