mod env;
mod types;


pub use types::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use tether_tools::{PolicyGate, TIMEOUT_CEILING_SECS};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

impl Config {
    /// Load configuration from a TOML file with env var overrides, then validate it.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or if the resulting
    /// configuration fails [`Config::validate`].
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot honour.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        let runner = &self.tools.runner;
        if runner.max_timeout_secs == 0 || runner.max_timeout_secs > TIMEOUT_CEILING_SECS {
            bail!(
                "tools.runner.max_timeout_secs must be between 1 and {TIMEOUT_CEILING_SECS}, got {}",
                runner.max_timeout_secs
            );
        }
        if runner.default_timeout_secs == 0 {
            bail!("tools.runner.default_timeout_secs must be greater than 0");
        }
        if runner.default_timeout_secs > runner.max_timeout_secs {
            bail!(
                "tools.runner.default_timeout_secs ({}) exceeds max_timeout_secs ({})",
                runner.default_timeout_secs,
                runner.max_timeout_secs
            );
        }
        if runner.max_output_bytes == 0 {
            bail!("tools.runner.max_output_bytes must be greater than 0");
        }

        let limits = &self.tools.limits;
        for (name, value) in [
            ("identifier", limits.identifier),
            ("path", limits.path),
            ("text", limits.text),
            ("message", limits.message),
        ] {
            if value == 0 {
                bail!("tools.limits.{name} must be greater than 0");
            }
        }

        PolicyGate::from_config(&self.tools.policy).context("invalid tools.policy pattern")?;
        Ok(())
    }
}

/// Config file location: `--config <path>` from the command line, else `TETHER_CONFIG`, else
/// [`DEFAULT_CONFIG_PATH`].
#[must_use]
pub fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("TETHER_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}
