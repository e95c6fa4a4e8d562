//! Governor configuration.
//!
//! Loaded the way the teacher's V4 configuration layer loads settings: a
//! `Default` impl doubles as the base layer, a `figment::Provider` exposes
//! that default to `Figment`, and `toml`/environment-variable providers
//! layer on top. `Settings::validate()` rejects anything that would make
//! the budget engine or classifier misbehave before the governor binds
//! anything.

use std::path::PathBuf;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::{Figment, Provider};
use serde::{Deserialize, Serialize};

use crate::budget::TokenBudgetConfig;
use crate::classifier::ClassifierConfig;
use crate::validation::is_in_range;

const ENV_PREFIX: &str = "GOVERNOR_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub budget: TokenBudgetConfig,
    pub classifier: ClassifierConfig,
    pub timeouts: TimeoutSettings,
    pub idle_shutdown_minutes: u64,
    pub maintenance_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            budget: TokenBudgetConfig::default(),
            classifier: ClassifierConfig::default(),
            timeouts: TimeoutSettings::default(),
            idle_shutdown_minutes: 30,
            maintenance_interval_ms: 500,
        }
    }
}

impl Provider for Settings {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("Governor Defaults")
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(Settings::default()).data()
    }
}

/// Timeouts observed by the shim side of the protocol (milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub connect_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub release_timeout_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2_000,
            acquire_timeout_ms: 60_000,
            release_timeout_ms: 5_000,
        }
    }
}

impl TimeoutSettings {
    fn validate(&self) -> Result<()> {
        is_in_range(self.connect_timeout_ms, 100..=30_000)
            .map_err(anyhow::Error::msg)
            .context("connect_timeout_ms must be between 100ms and 30s")?;
        is_in_range(self.acquire_timeout_ms, 1_000..=300_000)
            .map_err(anyhow::Error::msg)
            .context("acquire_timeout_ms must be between 1s and 300s")?;
        is_in_range(self.release_timeout_ms, 100..=60_000)
            .map_err(anyhow::Error::msg)
            .context("release_timeout_ms must be between 100ms and 60s")?;
        Ok(())
    }
}

impl Settings {
    /// Loads configuration layered as: built-in defaults, then an optional
    /// `build-governor.toml` in the current directory, then `GOVERNOR_*`
    /// environment variables. Validates before returning.
    pub fn load() -> Result<Self> {
        Self::load_from(PathBuf::from("build-governor.toml"))
    }

    pub fn load_from(config_path: PathBuf) -> Result<Self> {
        let figment = Figment::from(Settings::default())
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX));

        let settings: Settings = figment
            .extract()
            .context("failed to deserialize governor configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.log_level.to_lowercase().as_str()) {
            anyhow::bail!("invalid log level: {}", self.log_level);
        }

        self.budget
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid token budget configuration")?;

        self.timeouts
            .validate()
            .context("invalid timeout configuration")?;

        is_in_range(self.maintenance_interval_ms, 50..=60_000)
            .map_err(anyhow::Error::msg)
            .context("maintenance_interval_ms must be between 50ms and 60s")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut settings = Settings::default();
        settings.log_level = "shout".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn non_monotone_budget_thresholds_are_rejected() {
        let mut settings = Settings::default();
        settings.budget.hard_stop_ratio = settings.budget.caution_ratio;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn out_of_range_maintenance_interval_is_rejected() {
        let mut settings = Settings::default();
        settings.maintenance_interval_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn load_from_missing_file_falls_back_to_defaults() {
        let settings = Settings::load_from(PathBuf::from("/nonexistent/build-governor.toml"))
            .expect("missing config file should not be fatal");
        assert_eq!(settings.log_level, "info");
    }
}
