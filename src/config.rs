//! Process configuration assembled from the environment.
//!
//! Each component owns its config struct and its own `from_env`; this
//! module only gathers them plus the handful of process-level knobs.

use anyhow::Result;
use std::path::PathBuf;

use crate::gap::GapConfig;
use crate::kis::{AuthConfig, RateLimitConfig, WsConfig};
use crate::lifecycle::LifecycleConfig;
use crate::slot::SlotConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub auth: AuthConfig,
    pub ws: WsConfig,
    pub rate: RateLimitConfig,
    pub slot: SlotConfig,
    pub gap: GapConfig,
    pub lifecycle: LifecycleConfig,
    /// Overflow and gap ledgers land here.
    pub system_log_dir: PathBuf,
    /// Daily scalp tick files land here.
    pub scalp_data_dir: PathBuf,
    /// Symbols given slots at startup, before any trigger fires.
    pub seed_symbols: Vec<String>,
}

impl Config {
    /// Assemble the full runtime configuration. `.env` is expected to be
    /// loaded by the binary before this runs.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            auth: AuthConfig::from_env()?,
            ws: WsConfig::from_env(),
            rate: RateLimitConfig::from_env(),
            slot: SlotConfig::from_env(),
            gap: GapConfig::from_env(),
            lifecycle: LifecycleConfig::from_env(),
            system_log_dir: std::env::var("SYSTEM_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("logs/system")),
            scalp_data_dir: std::env::var("SCALP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/scalp")),
            seed_symbols: parse_symbol_list(std::env::var("SEED_SYMBOLS").ok().as_deref()),
        })
    }
}

fn parse_symbol_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_list_parsing() {
        assert_eq!(
            parse_symbol_list(Some("005930, 000660,035720")),
            vec!["005930", "000660", "035720"]
        );
        assert_eq!(parse_symbol_list(Some(" , ,")), Vec::<String>::new());
        assert_eq!(parse_symbol_list(None), Vec::<String>::new());
    }
}
