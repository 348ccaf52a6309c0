use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs::File;
use std::num::{ParseFloatError, ParseIntError};
use std::path::Path;
use std::str::FromStr;

const DEFAULT_SYMBOL: &str = "ETHUSDC";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 3;
const DEFAULT_MONITOR_ERROR_PAUSE_SECS: u64 = 10;
const DEFAULT_GRACE_PERIOD_SECS: u64 = 15;
const DEFAULT_FILL_WAIT_ATTEMPTS: u32 = 10;
const DEFAULT_FILL_WAIT_INTERVAL_SECS: u64 = 1;
const DEFAULT_BRACKET_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_BRACKET_RETRY_DELAY_SECS: u64 = 1;
const DEFAULT_ALERT_TTL_SECS: u64 = 3600;
const DEFAULT_STATE_BACKUPS_KEPT: usize = 10;
const DEFAULT_CANCEL_PAUSE_MS: u64 = 100;

/// One rung of the reinforcement ladder. Capital is the margin committed at
/// that rung; notional = capital * leverage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderLevel {
    pub capital: Decimal,
    pub leverage: u32,
    pub tp_pct: Decimal,
    pub sl_pct: Decimal,
}

pub fn default_ladder() -> Vec<LadderLevel> {
    vec![
        LadderLevel {
            capital: dec!(1.0),
            leverage: 50,
            tp_pct: dec!(0.003),
            sl_pct: dec!(0.003),
        },
        LadderLevel {
            capital: dec!(2.0),
            leverage: 50,
            tp_pct: dec!(0.003),
            sl_pct: dec!(0.003),
        },
        LadderLevel {
            capital: dec!(4.5),
            leverage: 50,
            tp_pct: dec!(0.003),
            sl_pct: dec!(0.003),
        },
        LadderLevel {
            capital: dec!(9.5),
            leverage: 50,
            tp_pct: dec!(0.003),
            sl_pct: dec!(0.003),
        },
        LadderLevel {
            capital: dec!(16.0),
            leverage: 65,
            tp_pct: dec!(0.003),
            sl_pct: dec!(0.003),
        },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Paper,
    Testnet,
    Live,
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "paper" | "dry" => Ok(RunMode::Paper),
            "testnet" => Ok(RunMode::Testnet),
            "live" | "real" => Ok(RunMode::Live),
            other => Err(ConfigError::InvalidRunMode(other.to_string())),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunMode::Paper => write!(f, "paper"),
            RunMode::Testnet => write!(f, "testnet"),
            RunMode::Live => write!(f, "live"),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ParseIntError(ParseIntError),
    ParseFloatError(ParseFloatError),
    InvalidRunMode(String),
    InvalidLadder(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ParseIntError(e) => write!(f, "Parse int error: {}", e),
            ConfigError::ParseFloatError(e) => write!(f, "Parse float error: {}", e),
            ConfigError::InvalidRunMode(v) => {
                write!(f, "Invalid run mode '{}' (paper|testnet|live)", v)
            }
            ConfigError::InvalidLadder(v) => write!(f, "Invalid ladder: {}", v),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ParseIntError> for ConfigError {
    fn from(err: ParseIntError) -> ConfigError {
        ConfigError::ParseIntError(err)
    }
}

impl From<ParseFloatError> for ConfigError {
    fn from(err: ParseFloatError) -> ConfigError {
        ConfigError::ParseFloatError(err)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct LadderBotYaml {
    run_mode: Option<String>,
    default_symbol: Option<String>,
    port: Option<u16>,
    data_dir: Option<String>,
    levels: Option<Vec<LadderLevel>>,
    lock_timeout_secs: Option<u64>,
    monitor_interval_secs: Option<u64>,
    monitor_error_pause_secs: Option<u64>,
    grace_period_secs: Option<u64>,
    fill_wait_attempts: Option<u32>,
    fill_wait_interval_secs: Option<u64>,
    bracket_retry_attempts: Option<u32>,
    bracket_retry_delay_secs: Option<u64>,
    alert_ttl_secs: Option<u64>,
    state_backups_kept: Option<usize>,
    cancel_pause_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub run_mode: RunMode,
    pub default_symbol: String,
    pub port: u16,
    pub data_dir: String,
    pub levels: Vec<LadderLevel>,
    pub lock_timeout_secs: u64,
    pub monitor_interval_secs: u64,
    pub monitor_error_pause_secs: u64,
    pub grace_period_secs: u64,
    pub fill_wait_attempts: u32,
    pub fill_wait_interval_secs: u64,
    pub bracket_retry_attempts: u32,
    pub bracket_retry_delay_secs: u64,
    pub alert_ttl_secs: u64,
    pub state_backups_kept: usize,
    pub cancel_pause_ms: u64,
}

impl BotConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("LADDERBOT_CONFIG")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open config {}", path_ref.display()))?;
        let yaml: LadderBotYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse config {}", path_ref.display()))?;

        let run_mode = match yaml.run_mode {
            Some(value) => value.parse::<RunMode>()?,
            None => RunMode::Paper,
        };

        let mut cfg = BotConfig {
            run_mode,
            default_symbol: yaml
                .default_symbol
                .unwrap_or_else(|| DEFAULT_SYMBOL.to_string()),
            port: yaml.port.unwrap_or(DEFAULT_PORT),
            data_dir: yaml.data_dir.unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            levels: yaml.levels.unwrap_or_else(default_ladder),
            lock_timeout_secs: yaml.lock_timeout_secs.unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS),
            monitor_interval_secs: yaml
                .monitor_interval_secs
                .unwrap_or(DEFAULT_MONITOR_INTERVAL_SECS),
            monitor_error_pause_secs: yaml
                .monitor_error_pause_secs
                .unwrap_or(DEFAULT_MONITOR_ERROR_PAUSE_SECS),
            grace_period_secs: yaml.grace_period_secs.unwrap_or(DEFAULT_GRACE_PERIOD_SECS),
            fill_wait_attempts: yaml
                .fill_wait_attempts
                .unwrap_or(DEFAULT_FILL_WAIT_ATTEMPTS),
            fill_wait_interval_secs: yaml
                .fill_wait_interval_secs
                .unwrap_or(DEFAULT_FILL_WAIT_INTERVAL_SECS),
            bracket_retry_attempts: yaml
                .bracket_retry_attempts
                .unwrap_or(DEFAULT_BRACKET_RETRY_ATTEMPTS),
            bracket_retry_delay_secs: yaml
                .bracket_retry_delay_secs
                .unwrap_or(DEFAULT_BRACKET_RETRY_DELAY_SECS),
            alert_ttl_secs: yaml.alert_ttl_secs.unwrap_or(DEFAULT_ALERT_TTL_SECS),
            state_backups_kept: yaml
                .state_backups_kept
                .unwrap_or(DEFAULT_STATE_BACKUPS_KEPT),
            cancel_pause_ms: yaml.cancel_pause_ms.unwrap_or(DEFAULT_CANCEL_PAUSE_MS),
        };

        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = BotConfig {
            run_mode: RunMode::Paper,
            default_symbol: DEFAULT_SYMBOL.to_string(),
            port: DEFAULT_PORT,
            data_dir: DEFAULT_DATA_DIR.to_string(),
            levels: default_ladder(),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            monitor_interval_secs: DEFAULT_MONITOR_INTERVAL_SECS,
            monitor_error_pause_secs: DEFAULT_MONITOR_ERROR_PAUSE_SECS,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            fill_wait_attempts: DEFAULT_FILL_WAIT_ATTEMPTS,
            fill_wait_interval_secs: DEFAULT_FILL_WAIT_INTERVAL_SECS,
            bracket_retry_attempts: DEFAULT_BRACKET_RETRY_ATTEMPTS,
            bracket_retry_delay_secs: DEFAULT_BRACKET_RETRY_DELAY_SECS,
            alert_ttl_secs: DEFAULT_ALERT_TTL_SECS,
            state_backups_kept: DEFAULT_STATE_BACKUPS_KEPT,
            cancel_pause_ms: DEFAULT_CANCEL_PAUSE_MS,
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = env::var("RUN_MODE") {
            if !value.trim().is_empty() {
                self.run_mode = value.parse()?;
            }
        }
        if let Ok(value) = env::var("DEFAULT_SYMBOL") {
            if !value.trim().is_empty() {
                self.default_symbol = value.trim().to_string();
            }
        }
        if let Ok(value) = env::var("PORT") {
            self.port = value.parse()?;
        }
        if let Ok(value) = env::var("DATA_DIR") {
            if !value.trim().is_empty() {
                self.data_dir = value;
            }
        }
        if let Ok(value) = env::var("LOCK_TIMEOUT_SECS") {
            self.lock_timeout_secs = value.parse()?;
        }
        if let Ok(value) = env::var("MONITOR_INTERVAL_SECS") {
            self.monitor_interval_secs = value.parse()?;
        }
        if let Ok(value) = env::var("MONITOR_ERROR_PAUSE_SECS") {
            self.monitor_error_pause_secs = value.parse()?;
        }
        if let Ok(value) = env::var("GRACE_PERIOD_SECS") {
            self.grace_period_secs = value.parse()?;
        }
        if let Ok(value) = env::var("FILL_WAIT_ATTEMPTS") {
            self.fill_wait_attempts = value.parse()?;
        }
        if let Ok(value) = env::var("FILL_WAIT_INTERVAL_SECS") {
            self.fill_wait_interval_secs = value.parse()?;
        }
        if let Ok(value) = env::var("BRACKET_RETRY_ATTEMPTS") {
            self.bracket_retry_attempts = value.parse()?;
        }
        if let Ok(value) = env::var("BRACKET_RETRY_DELAY_SECS") {
            self.bracket_retry_delay_secs = value.parse()?;
        }
        if let Ok(value) = env::var("ALERT_TTL_SECS") {
            self.alert_ttl_secs = value.parse()?;
        }
        if let Ok(value) = env::var("STATE_BACKUPS_KEPT") {
            self.state_backups_kept = value.parse()?;
        }
        if let Ok(value) = env::var("CANCEL_PAUSE_MS") {
            self.cancel_pause_ms = value.parse()?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.levels.is_empty() {
            return Err(ConfigError::InvalidLadder("no levels configured".into()));
        }
        for (idx, level) in self.levels.iter().enumerate() {
            if level.capital <= Decimal::ZERO {
                return Err(ConfigError::InvalidLadder(format!(
                    "level {} capital must be positive",
                    idx + 1
                )));
            }
            if level.leverage == 0 {
                return Err(ConfigError::InvalidLadder(format!(
                    "level {} leverage must be at least 1",
                    idx + 1
                )));
            }
            if level.tp_pct <= Decimal::ZERO || level.sl_pct <= Decimal::ZERO {
                return Err(ConfigError::InvalidLadder(format!(
                    "level {} tp/sl percentages must be positive",
                    idx + 1
                )));
            }
        }
        Ok(())
    }

    /// Ladder levels are 1-based everywhere outside this accessor.
    pub fn level(&self, level: u32) -> Option<&LadderLevel> {
        if level == 0 {
            return None;
        }
        self.levels.get(level as usize - 1)
    }

    pub fn max_level(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn total_capital(&self) -> Decimal {
        self.levels.iter().map(|l| l.capital).sum()
    }

    pub fn log_summary(&self) {
        log::info!("[CONFIG] RUN_MODE is: {}", self.run_mode);
        log::info!(
            "[CONFIG] DEFAULT_SYMBOL={} PORT={} DATA_DIR={}",
            self.default_symbol,
            self.port,
            self.data_dir
        );
        log::info!(
            "[CONFIG] MONITOR_INTERVAL_SECS={} GRACE_PERIOD_SECS={} LOCK_TIMEOUT_SECS={}",
            self.monitor_interval_secs,
            self.grace_period_secs,
            self.lock_timeout_secs
        );
        log::info!(
            "[CONFIG] FILL_WAIT_ATTEMPTS={} BRACKET_RETRY_ATTEMPTS={} ALERT_TTL_SECS={}",
            self.fill_wait_attempts,
            self.bracket_retry_attempts,
            self.alert_ttl_secs
        );
        for (idx, level) in self.levels.iter().enumerate() {
            log::info!(
                "[CONFIG] level {}: capital={} leverage={} tp_pct={} sl_pct={}",
                idx + 1,
                level.capital,
                level.leverage,
                level.tp_pct,
                level.sl_pct
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_ladder_has_five_levels() {
        let ladder = default_ladder();
        assert_eq!(ladder.len(), 5);
        assert_eq!(ladder[0].capital, dec!(1.0));
        assert_eq!(ladder[0].leverage, 50);
        assert_eq!(ladder[4].capital, dec!(16.0));
        assert_eq!(ladder[4].leverage, 65);
        for level in &ladder {
            assert_eq!(level.tp_pct, dec!(0.003));
            assert_eq!(level.sl_pct, dec!(0.003));
        }
    }

    #[test]
    fn level_accessor_is_one_based() {
        let cfg = BotConfig {
            run_mode: RunMode::Paper,
            default_symbol: DEFAULT_SYMBOL.to_string(),
            port: DEFAULT_PORT,
            data_dir: DEFAULT_DATA_DIR.to_string(),
            levels: default_ladder(),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            monitor_interval_secs: DEFAULT_MONITOR_INTERVAL_SECS,
            monitor_error_pause_secs: DEFAULT_MONITOR_ERROR_PAUSE_SECS,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            fill_wait_attempts: DEFAULT_FILL_WAIT_ATTEMPTS,
            fill_wait_interval_secs: DEFAULT_FILL_WAIT_INTERVAL_SECS,
            bracket_retry_attempts: DEFAULT_BRACKET_RETRY_ATTEMPTS,
            bracket_retry_delay_secs: DEFAULT_BRACKET_RETRY_DELAY_SECS,
            alert_ttl_secs: DEFAULT_ALERT_TTL_SECS,
            state_backups_kept: DEFAULT_STATE_BACKUPS_KEPT,
            cancel_pause_ms: DEFAULT_CANCEL_PAUSE_MS,
        };
        assert!(cfg.level(0).is_none());
        assert_eq!(cfg.level(1).unwrap().capital, dec!(1.0));
        assert_eq!(cfg.level(5).unwrap().leverage, 65);
        assert!(cfg.level(6).is_none());
        assert_eq!(cfg.max_level(), 5);
        assert_eq!(cfg.total_capital(), dec!(33.0));
    }

    #[test]
    fn yaml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "run_mode: testnet\nmonitor_interval_secs: 7\nlevels:\n  - capital: 5\n    leverage: 10\n    tp_pct: 0.01\n    sl_pct: 0.02"
        )
        .unwrap();

        let cfg = BotConfig::from_yaml_path(file.path()).unwrap();
        assert_eq!(cfg.run_mode, RunMode::Testnet);
        assert_eq!(cfg.monitor_interval_secs, 7);
        assert_eq!(cfg.levels.len(), 1);
        assert_eq!(cfg.levels[0].leverage, 10);
        assert_eq!(cfg.levels[0].sl_pct, dec!(0.02));
        // untouched fields keep their defaults
        assert_eq!(cfg.grace_period_secs, DEFAULT_GRACE_PERIOD_SECS);
        assert_eq!(cfg.default_symbol, DEFAULT_SYMBOL);
    }

    #[test]
    fn empty_ladder_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "levels: []").unwrap();
        assert!(BotConfig::from_yaml_path(file.path()).is_err());
    }

    #[test]
    fn run_mode_parses_aliases() {
        assert_eq!("paper".parse::<RunMode>().unwrap(), RunMode::Paper);
        assert_eq!("dry".parse::<RunMode>().unwrap(), RunMode::Paper);
        assert_eq!("TESTNET".parse::<RunMode>().unwrap(), RunMode::Testnet);
        assert_eq!("live".parse::<RunMode>().unwrap(), RunMode::Live);
        assert!("yolo".parse::<RunMode>().is_err());
    }
}
