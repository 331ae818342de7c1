use secrecy::Secret;
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionsConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub letter: LetterConfig,
    pub scheduler: SchedulerConfig,
    pub reminder: ReminderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Postal letter provider settings. When disabled the mock sender is used,
/// which logs instead of calling the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct LetterConfig {
    pub api_url: String,
    pub api_token: Secret<String>,
    pub enabled: bool,
    /// Address for operator alerts (new disputes). None disables alerts.
    pub staff_alert_email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between reminder ticks. Zero disables the background loop.
    pub tick_interval_secs: u64,
    /// Pending dispatch claims older than this are treated as orphaned.
    pub stale_claim_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReminderConfig {
    /// Cooldown applied when a rule does not carry its own.
    pub default_cooldown_days: i64,
    /// Max invoices matched per rule per run.
    pub batch_limit: i64,
}

impl CollectionsConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = core_config::is_production();

        Ok(CollectionsConfig {
            common: common_config,
            service_name: get_env("SERVICE_NAME", Some("collections-service"), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: get_env("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?
                    .parse()
                    .unwrap_or(10),
                min_connections: get_env("DATABASE_MIN_CONNECTIONS", Some("2"), is_prod)?
                    .parse()
                    .unwrap_or(2),
            },
            letter: LetterConfig {
                api_url: get_env("LETTER_API_URL", Some("http://localhost:9200"), is_prod)?,
                api_token: Secret::new(get_env("LETTER_API_TOKEN", Some(""), is_prod)?),
                enabled: env::var("LETTER_ENABLED")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse()
                    .unwrap_or(false),
                staff_alert_email: env::var("STAFF_ALERT_EMAIL").ok(),
            },
            scheduler: SchedulerConfig {
                tick_interval_secs: get_env("SCHEDULER_TICK_INTERVAL_SECS", Some("300"), is_prod)?
                    .parse()
                    .unwrap_or(300),
                stale_claim_minutes: get_env("SCHEDULER_STALE_CLAIM_MINUTES", Some("15"), is_prod)?
                    .parse()
                    .unwrap_or(15),
            },
            reminder: ReminderConfig {
                default_cooldown_days: get_env("REMINDER_DEFAULT_COOLDOWN_DAYS", Some("7"), is_prod)?
                    .parse()
                    .unwrap_or(7),
                batch_limit: get_env("REMINDER_BATCH_LIMIT", Some("200"), is_prod)?
                    .parse()
                    .unwrap_or(200),
            },
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}
