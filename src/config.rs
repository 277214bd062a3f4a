//! Configuration for settlement-core

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("settlement-core")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// HTTP API port for gateway callbacks and operator calls
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Seconds between automatic category sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Account id used for platform lines (stored as NULL recipient)
    #[serde(default = "default_platform_account")]
    pub platform_account: String,

    /// Operator ids allowed to run privileged category and settlement calls
    #[serde(default)]
    pub authorized_operators: Vec<String>,

    #[serde(default)]
    pub split: SplitConfig,

    #[serde(default)]
    pub category: CategoryConfig,

    #[serde(default)]
    pub ranking: RankingConfig,

    #[serde(default)]
    pub points: PointsConfig,
}

/// Split Calculator parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Minor units per whole currency unit; participant payouts are multiples of this
    #[serde(default = "default_unit")]
    pub unit: i64,
}

/// Category lifecycle parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    #[serde(default = "default_cycle_duration_hours")]
    pub cycle_duration_hours: i64,

    #[serde(default = "default_activation_threshold")]
    pub default_activation_threshold: i64,

    #[serde(default = "default_max_item_count")]
    pub default_max_item_count: i64,
}

/// Daily ranking and pot parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Number of ranks flagged as top tier
    #[serde(default = "default_top_tier_size")]
    pub top_tier_size: i64,

    /// Share of the daily pot going to top-tier participants, in basis points
    #[serde(default = "default_pot_top_tier_share_bps")]
    pub pot_top_tier_share_bps: i64,

    /// Minor units of a sale that make up one backer vote
    #[serde(default = "default_minor_units_per_vote")]
    pub minor_units_per_vote: i64,
}

/// Loyalty point parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointsConfig {
    #[serde(default = "default_points_per_unit")]
    pub points_per_unit: i64,

    #[serde(default = "default_cashout_threshold")]
    pub cashout_threshold: i64,
}

fn default_http_port() -> u16 {
    8095
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_platform_account() -> String {
    "platform".to_string()
}

fn default_unit() -> i64 {
    100
}

fn default_cycle_duration_hours() -> i64 {
    168
}

fn default_activation_threshold() -> i64 {
    30
}

fn default_max_item_count() -> i64 {
    100
}

fn default_top_tier_size() -> i64 {
    10
}

fn default_pot_top_tier_share_bps() -> i64 {
    5000
}

fn default_minor_units_per_vote() -> i64 {
    10
}

fn default_points_per_unit() -> i64 {
    100
}

fn default_cashout_threshold() -> i64 {
    2500
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self { unit: default_unit() }
    }
}

impl Default for CategoryConfig {
    fn default() -> Self {
        Self {
            cycle_duration_hours: default_cycle_duration_hours(),
            default_activation_threshold: default_activation_threshold(),
            default_max_item_count: default_max_item_count(),
        }
    }
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            top_tier_size: default_top_tier_size(),
            pot_top_tier_share_bps: default_pot_top_tier_share_bps(),
            minor_units_per_vote: default_minor_units_per_vote(),
        }
    }
}

impl Default for PointsConfig {
    fn default() -> Self {
        Self {
            points_per_unit: default_points_per_unit(),
            cashout_threshold: default_cashout_threshold(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            http_port: default_http_port(),
            sweep_interval_secs: default_sweep_interval(),
            platform_account: default_platform_account(),
            authorized_operators: Vec::new(),
            split: SplitConfig::default(),
            category: CategoryConfig::default(),
            ranking: RankingConfig::default(),
            points: PointsConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<(), crate::error::SettlementError> {
        use crate::error::SettlementError;

        if self.split.unit <= 0 {
            return Err(SettlementError::Config("split.unit must be positive".into()));
        }
        if self.category.cycle_duration_hours <= 0 {
            return Err(SettlementError::Config(
                "category.cycle_duration_hours must be positive".into(),
            ));
        }
        if !(0..=10_000).contains(&self.ranking.pot_top_tier_share_bps) {
            return Err(SettlementError::Config(
                "ranking.pot_top_tier_share_bps must be within 0..=10000".into(),
            ));
        }
        if self.ranking.top_tier_size <= 0 || self.ranking.minor_units_per_vote <= 0 {
            return Err(SettlementError::Config(
                "ranking.top_tier_size and ranking.minor_units_per_vote must be positive".into(),
            ));
        }
        if self.points.points_per_unit <= 0 {
            return Err(SettlementError::Config("points.points_per_unit must be positive".into()));
        }
        Ok(())
    }

    /// Get SQLite database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join("settlement.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.split.unit, 100);
        assert_eq!(config.category.cycle_duration_hours, 168);
        assert_eq!(config.ranking.pot_top_tier_share_bps, 5000);
        assert_eq!(config.points.cashout_threshold, 2500);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
http_port = 9000
authorized_operators = ["op-1"]

[ranking]
pot_top_tier_share_bps = 6000
"#,
        )
        .unwrap();

        assert_eq!(config.http_port, 9000);
        assert_eq!(config.authorized_operators, vec!["op-1".to_string()]);
        assert_eq!(config.ranking.pot_top_tier_share_bps, 6000);
        assert_eq!(config.ranking.top_tier_size, 10);
        assert_eq!(config.category.default_activation_threshold, 30);
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let mut config = Config::default();
        config.ranking.pot_top_tier_share_bps = 12_000;
        assert!(config.validate().is_err());
    }
}
