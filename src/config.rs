//! Environment-driven configuration, following the recognized-options table.

use std::time::Duration;

/// Parsed process configuration. Durations are stored as [`Duration`]; the
/// environment spells them with a trailing unit suffix (`12m`, `360h`, ...).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub kms_key_id: String,

    pub max_runtime: Duration,
    pub import_lock_time: Duration,
    pub import_retry_rate: Duration,
    pub max_insert_batch_size: usize,
    pub max_interval_age_on_publish: Duration,
    pub max_symptom_onset_days: i64,
    pub truncate_window: Duration,
    pub new_key_period: Duration,
    pub delete_old_key_period: Duration,
    pub import_app_package_name: String,
    pub index_file_download_timeout: Duration,
    pub export_file_download_timeout: Duration,

    /// Fallback report type stamped onto keys that arrive with none set.
    pub backfill_report_type: Option<i32>,
    /// Fallback days-since-onset value stamped onto keys that arrive with none set.
    pub backfill_days_since_onset_value: Option<i32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid duration for {name}: {value}")]
    InvalidDuration { name: &'static str, value: String },
    #[error("invalid integer for {name}: {value}")]
    InvalidInt { name: &'static str, value: String },
}

fn env_or(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

/// Parses durations of the form `<number><unit>` where unit is one of
/// `s`, `m`, `h`. This mirrors the compact duration spelling used throughout
/// the recognized-options table (`12m`, `360h`, ...).
fn parse_duration(name: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let (digits, unit) = raw.split_at(raw.len().saturating_sub(1));
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidDuration { name, value: raw.to_string() })?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        _ => return Err(ConfigError::InvalidDuration { name, value: raw.to_string() }),
    };
    Ok(Duration::from_secs(seconds))
}

fn env_duration(name: &'static str, default: &str) -> Result<Duration, ConfigError> {
    parse_duration(name, &env_or(name, default))
}

fn env_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env_or(name, &default.to_string());
    raw.parse()
        .map_err(|_| ConfigError::InvalidInt { name, value: raw })
}

fn env_i64(name: &'static str, default: i64) -> Result<i64, ConfigError> {
    let raw = env_or(name, &default.to_string());
    raw.parse()
        .map_err(|_| ConfigError::InvalidInt { name, value: raw })
}

/// Reads an optional integer, absent entirely when the variable is unset.
fn env_opt_i32(name: &'static str) -> Result<Option<i32>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidInt { name, value: raw }),
        Err(_) => Ok(None),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: env_required("DATABASE_URL")?,
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            kms_key_id: env_or("KMS_KEY_ID", ""),

            max_runtime: env_duration("MAX_RUNTIME", "12m")?,
            import_lock_time: env_duration("IMPORT_LOCK_TIME", "13m")?,
            import_retry_rate: env_duration("IMPORT_RETRY_RATE", "1h")?,
            max_insert_batch_size: env_usize("MAX_INSERT_BATCH_SIZE", 100)?,
            max_interval_age_on_publish: env_duration("MAX_INTERVAL_AGE_ON_PUBLISH", "360h")?,
            max_symptom_onset_days: env_i64("MAX_SYMPTOM_ONSET_DAYS", 14)?,
            truncate_window: env_duration("TRUNCATE_WINDOW", "1h")?,
            new_key_period: env_duration("NEW_KEY_PERIOD", "168h")?,
            delete_old_key_period: env_duration("DELETE_OLD_KEY_PERIOD", "360h")?,
            import_app_package_name: env_or("IMPORT_APP_PACKAGE_NAME", "com.example.exposurenotification"),
            index_file_download_timeout: env_duration("INDEX_FILE_DOWNLOAD_TIMEOUT", "1m")?,
            export_file_download_timeout: env_duration("EXPORT_FILE_DOWNLOAD_TIMEOUT", "2m")?,

            backfill_report_type: env_opt_i32("BACKFILL_REPORT_TYPE")?,
            backfill_days_since_onset_value: env_opt_i32("BACKFILL_DAYS_SINCE_ONSET_VALUE")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minutes_and_hours() {
        assert_eq!(parse_duration("X", "12m").unwrap(), Duration::from_secs(12 * 60));
        assert_eq!(parse_duration("X", "360h").unwrap(), Duration::from_secs(360 * 3600));
        assert_eq!(parse_duration("X", "30s").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_bad_unit() {
        assert!(parse_duration("X", "12x").is_err());
    }
}
