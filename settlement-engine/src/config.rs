//! Configuration loading
//!
//! Defaults, overlaid by an optional `settlement.toml`, overlaid by
//! `SETTLEMENT__*` environment variables (double underscore separates
//! nesting, e.g. `SETTLEMENT__ENGINE__BROADCAST_TIMEOUT_SECS=5`).

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::dispute::WindowConfig;
use crate::engine::EngineConfig;
use crate::error::SettlementError;
use crate::SettlementResult;

/// Top-level settings for the settlement core
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineConfig,
    pub window: WindowConfig,
}

impl Settings {
    /// Load layered settings from disk and environment
    pub fn load() -> SettlementResult<Self> {
        Self::load_from("settlement")
    }

    /// Load with an explicit file stem (without extension)
    pub fn load_from(file_stem: &str) -> SettlementResult<Self> {
        let config = Config::builder()
            .add_source(File::with_name(file_stem).required(false))
            .add_source(Environment::with_prefix("SETTLEMENT").separator("__"))
            .build()
            .map_err(|e| SettlementError::validation(format!("configuration error: {e}")))?;

        config
            .try_deserialize()
            .map_err(|e| SettlementError::validation(format!("configuration error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_any_sources() {
        let settings = Settings::load_from("settlement-missing").unwrap();
        assert_eq!(settings.engine.broadcast_timeout_secs, 10);
        assert_eq!(settings.engine.default_dispute_window_minutes, 30);
        assert_eq!(settings.engine.per_payment_limit, None);
        assert_eq!(settings.window.scan_interval_secs, 60);
    }
}
