// =============================================================================
// Bot Configuration — immutable, read once at startup
// =============================================================================
//
// Settings come from a JSON file (path in BANDLINE_CONFIG, default
// bandline.json) with serde defaults, so older files missing new fields keep
// loading. API credentials are only ever read from the environment; they are
// never serialized back out.
// =============================================================================

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::types::{Interval, Mode};

/// Fatal configuration failure. Mapped to exit code 2 by `main`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_interval() -> Interval {
    Interval::M15
}

fn default_boll_period() -> usize {
    20
}

fn default_boll_std() -> f64 {
    2.0
}

fn default_leverage() -> u32 {
    10
}

fn default_trade_percent() -> f64 {
    0.70
}

fn default_fee_rate() -> f64 {
    0.0005
}

fn default_lot_step() -> f64 {
    0.001
}

fn default_sim_balance() -> f64 {
    1000.0
}

fn default_db_path() -> String {
    "bandline.db".to_string()
}

fn default_web_host() -> String {
    "0.0.0.0".to_string()
}

fn default_web_port() -> u16 {
    8080
}

// =============================================================================
// BotConfig
// =============================================================================

/// Top-level configuration for one engine instance. One instance owns one
/// symbol; running several symbols means running several processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Trading pair, e.g. "BTCUSDT".
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Kline interval driving the engine.
    #[serde(default = "default_interval")]
    pub interval: Interval,

    /// Bollinger window length P.
    #[serde(default = "default_boll_period")]
    pub boll_period: usize,

    /// Bollinger multiplier K.
    #[serde(default = "default_boll_std")]
    pub boll_std: f64,

    /// Futures leverage L.
    #[serde(default = "default_leverage")]
    pub leverage: u32,

    /// Fraction F of the available balance committed per open, 0 < F <= 1.
    #[serde(default = "default_trade_percent")]
    pub trade_percent: f64,

    /// Taker fee rate charged per fill.
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,

    /// Lot step used when the venue's filters are unavailable (sim mode).
    #[serde(default = "default_lot_step")]
    pub lot_step: f64,

    /// live: orders reach the exchange; sim: local ledger fills.
    #[serde(default)]
    pub mode: Mode,

    /// Starting quote balance for the simulated adapter.
    #[serde(default = "default_sim_balance")]
    pub sim_balance: f64,

    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Dashboard bind address.
    #[serde(default = "default_web_host")]
    pub web_host: String,

    #[serde(default = "default_web_port")]
    pub web_port: u16,

    /// API credentials, environment-only (BANDLINE_API_KEY / _API_SECRET).
    #[serde(skip)]
    pub api_key: String,

    #[serde(skip)]
    pub api_secret: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            interval: default_interval(),
            boll_period: default_boll_period(),
            boll_std: default_boll_std(),
            leverage: default_leverage(),
            trade_percent: default_trade_percent(),
            fee_rate: default_fee_rate(),
            lot_step: default_lot_step(),
            mode: Mode::Sim,
            sim_balance: default_sim_balance(),
            db_path: default_db_path(),
            web_host: default_web_host(),
            web_port: default_web_port(),
            api_key: String::new(),
            api_secret: String::new(),
        }
    }
}

impl BotConfig {
    /// Load configuration from `path`, pull credentials from the environment,
    /// and validate. A missing file falls back to defaults (sim mode works
    /// without any file at all).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let mut config: Self = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                source: e,
            })?
        } else {
            info!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.api_key = std::env::var("BANDLINE_API_KEY").unwrap_or_default();
        config.api_secret = std::env::var("BANDLINE_API_SECRET").unwrap_or_default();

        if let Ok(sym) = std::env::var("BANDLINE_SYMBOL") {
            let sym = sym.trim().to_uppercase();
            if !sym.is_empty() {
                config.symbol = sym;
            }
        }
        if let Ok(iv) = std::env::var("BANDLINE_INTERVAL") {
            config.interval = Interval::parse(iv.trim())
                .ok_or_else(|| ConfigError::Invalid(format!("unknown interval '{iv}'")))?;
        }

        config.validate()?;

        info!(
            symbol = %config.symbol,
            interval = %config.interval,
            boll_period = config.boll_period,
            boll_std = config.boll_std,
            leverage = config.leverage,
            mode = %config.mode,
            "config loaded"
        );

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::Invalid("symbol must not be empty".into()));
        }
        if self.boll_period < 2 {
            return Err(ConfigError::Invalid(format!(
                "boll_period must be >= 2, got {}",
                self.boll_period
            )));
        }
        if self.boll_std <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "boll_std must be positive, got {}",
                self.boll_std
            )));
        }
        if self.leverage == 0 {
            return Err(ConfigError::Invalid("leverage must be >= 1".into()));
        }
        if !(self.trade_percent > 0.0 && self.trade_percent <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "trade_percent must be in (0, 1], got {}",
                self.trade_percent
            )));
        }
        if self.fee_rate < 0.0 {
            return Err(ConfigError::Invalid("fee_rate must not be negative".into()));
        }
        if self.lot_step <= 0.0 {
            return Err(ConfigError::Invalid("lot_step must be positive".into()));
        }
        if self.mode == Mode::Live && (self.api_key.is_empty() || self.api_secret.is_empty()) {
            return Err(ConfigError::Invalid(
                "live mode requires BANDLINE_API_KEY and BANDLINE_API_SECRET".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_strategy_defaults() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.interval, Interval::M15);
        assert_eq!(cfg.boll_period, 20);
        assert!((cfg.boll_std - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.leverage, 10);
        assert!((cfg.trade_percent - 0.70).abs() < f64::EPSILON);
        assert!((cfg.fee_rate - 0.0005).abs() < f64::EPSILON);
        assert_eq!(cfg.mode, Mode::Sim);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: BotConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.boll_period, 20);
        assert_eq!(cfg.web_port, 8080);
        assert_eq!(cfg.mode, Mode::Sim);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbol": "ETHUSDT", "interval": "1h", "leverage": 5 }"#;
        let cfg: BotConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.interval, Interval::H1);
        assert_eq!(cfg.leverage, 5);
        assert!((cfg.trade_percent - 0.70).abs() < f64::EPSILON);
    }

    #[test]
    fn validation_rejects_bad_fraction() {
        let mut cfg = BotConfig::default();
        cfg.trade_percent = 0.0;
        assert!(cfg.validate().is_err());
        cfg.trade_percent = 1.5;
        assert!(cfg.validate().is_err());
        cfg.trade_percent = 1.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validation_rejects_live_without_credentials() {
        let mut cfg = BotConfig::default();
        cfg.mode = Mode::Live;
        assert!(cfg.validate().is_err());
        cfg.api_key = "k".into();
        cfg.api_secret = "s".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn credentials_never_serialize() {
        let mut cfg = BotConfig::default();
        cfg.api_key = "top-secret".into();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("top-secret"));
    }
}
