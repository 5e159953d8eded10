// =============================================================================
// Settings — YAML configuration with environment placeholder resolution
// =============================================================================
//
// Loaded once at boot. Every optional field carries a serde default so that
// older config files keep loading when new fields are added. Secrets are
// referenced as `${VAR}` placeholders and resolved from the environment at
// load time; an unset variable fails the boot rather than running with an
// empty credential.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Environment variable naming an explicit config file path.
pub const CONFIG_PATH_ENV: &str = "TRADER_CONFIG";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_currency() -> String {
    "USD".to_string()
}

fn default_db_engine() -> String {
    "sqlite".to_string()
}

fn default_pool_size() -> u32 {
    5
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_client_name() -> String {
    "meridian".to_string()
}

fn default_max_risk_per_trade() -> f64 {
    0.02
}

fn default_max_portfolio_heat() -> f64 {
    0.06
}

fn default_max_leverage() -> f64 {
    1.5
}

fn default_placeholder_equity() -> f64 {
    100_000.0
}

fn default_breaker_fraction() -> f64 {
    1.0
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_monitor_host() -> String {
    "0.0.0.0".to_string()
}

fn default_monitor_port() -> u16 {
    9000
}

fn default_exchange_module() -> String {
    "binanceusdm".to_string()
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_base_currency")]
    pub base_currency: String,
    /// When set, no order ever reaches a venue; orders are recorded locally.
    #[serde(default = "default_true")]
    pub dry_run: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            log_level: default_log_level(),
            base_currency: default_base_currency(),
            dry_run: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite` or `postgresql`; must agree with the URL scheme.
    #[serde(default = "default_db_engine")]
    pub engine: String,
    pub url: String,
    #[serde(default)]
    pub echo: bool,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default)]
    pub connect_args: HashMap<String, serde_json::Value>,
}

/// The six named streams binding the services together. All are required:
/// a missing stream name is a config error, not a silent default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStreamsConfig {
    pub market_data: String,
    pub signals: String,
    pub approved_signals: String,
    pub orders: String,
    pub executions: String,
    pub reconciliations: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// `false` selects the in-process bus (single-binary and test runs).
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    pub streams: RedisStreamsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolatilityTargetingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub target_portfolio_vol: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakersConfig {
    /// Daily loss halting threshold as a fraction of equity.
    #[serde(default = "default_breaker_fraction")]
    pub daily_loss: f64,
    /// Cumulative drawdown halting threshold as a fraction of equity.
    #[serde(default = "default_breaker_fraction")]
    pub total_drawdown: f64,
}

impl Default for CircuitBreakersConfig {
    fn default() -> Self {
        Self {
            daily_loss: default_breaker_fraction(),
            total_drawdown: default_breaker_fraction(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_risk_per_trade")]
    pub max_risk_per_trade: f64,
    #[serde(default = "default_max_portfolio_heat")]
    pub max_portfolio_heat: f64,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    /// Equity assumed until an account snapshot has been persisted.
    #[serde(default = "default_placeholder_equity")]
    pub placeholder_equity: f64,
    #[serde(default)]
    pub volatility_targeting: VolatilityTargetingConfig,
    #[serde(default)]
    pub circuit_breakers: CircuitBreakersConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_risk_per_trade: default_max_risk_per_trade(),
            max_portfolio_heat: default_max_portfolio_heat(),
            max_leverage: default_max_leverage(),
            placeholder_equity: default_placeholder_equity(),
            volatility_targeting: VolatilityTargetingConfig::default(),
            circuit_breakers: CircuitBreakersConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub module: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl StrategyConfig {
    /// Numeric parameter lookup with a fallback, tolerating YAML ints and
    /// floats interchangeably.
    pub fn param_f64(&self, key: &str, fallback: f64) -> f64 {
        self.parameters
            .get(key)
            .and_then(|v| v.as_f64())
            .unwrap_or(fallback)
    }

    pub fn param_usize(&self, key: &str, fallback: usize) -> usize {
        self.parameters
            .get(key)
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(fallback)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reconcile_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_true")]
    pub auto_repair: bool,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_reconcile_interval(),
            auto_repair: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_monitor_host")]
    pub host: String,
    #[serde(default = "default_monitor_port")]
    pub port: u16,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_monitor_host(),
            port: default_monitor_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    /// Health-check tuning passed through to external tooling.
    #[serde(default)]
    pub health_check: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    #[serde(default = "default_exchange_module")]
    pub module: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub sandbox: bool,
    #[serde(default)]
    pub symbols: Vec<String>,
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level settings for every service, loaded once at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub exchanges: Vec<ExchangeConfig>,
}

impl Settings {
    /// Load settings from the first existing candidate path: the explicit
    /// argument, `$TRADER_CONFIG`, `config/config.yaml`, then
    /// `config/config.example.yaml`.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(p) = explicit {
            candidates.push(p.to_path_buf());
        }
        if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV) {
            if !env_path.is_empty() {
                candidates.push(PathBuf::from(env_path));
            }
        }
        candidates.push(PathBuf::from("config/config.yaml"));
        candidates.push(PathBuf::from("config/config.example.yaml"));

        for path in &candidates {
            if path.exists() {
                return Self::from_file(path);
            }
        }
        bail!(
            "no configuration file found; set {} or provide config/config.yaml",
            CONFIG_PATH_ENV
        );
    }

    /// Parse a single YAML file, resolving `${VAR}` placeholders.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let settings = Self::from_yaml(&raw)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        info!(
            path = %path.display(),
            environment = %settings.app.environment,
            dry_run = settings.app.dry_run,
            "settings loaded"
        );
        Ok(settings)
    }

    /// Parse YAML text, resolving `${VAR}` placeholders against the process
    /// environment before deserialisation.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(raw).context("invalid YAML in config")?;
        let resolved = resolve_env_placeholders(value)?;
        let settings: Settings =
            serde_yaml::from_value(resolved).context("config failed schema validation")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        match self.database.engine.as_str() {
            "sqlite" | "postgresql" => {}
            other => bail!("database.engine must be sqlite or postgresql, got '{other}'"),
        }
        Ok(())
    }
}

/// Recursively replace any string of the exact form `${VAR}` with the value
/// of the environment variable `VAR`. An unset variable is a hard error.
fn resolve_env_placeholders(value: serde_yaml::Value) -> Result<serde_yaml::Value> {
    use serde_yaml::Value;

    Ok(match value {
        Value::String(s) => {
            if let Some(var) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
                let resolved = std::env::var(var)
                    .with_context(|| format!("environment variable {var} is not set"))?;
                Value::String(resolved)
            } else {
                Value::String(s)
            }
        }
        Value::Sequence(items) => Value::Sequence(
            items
                .into_iter()
                .map(resolve_env_placeholders)
                .collect::<Result<_>>()?,
        ),
        Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k, resolve_env_placeholders(v)?);
            }
            Value::Mapping(out)
        }
        other => other,
    })
}
