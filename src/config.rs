//! Configuration types, loaded once from the environment at startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::broker::{BrokerConfig, RetentionPolicy};
use crate::dispatch::RetryPolicy;
use crate::envelope::EventType;
use crate::error::ConfigError;

/// Database path that selects the in-memory log.
pub const MEMORY_DB: &str = ":memory:";

/// Full pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Event-type prefix, e.g. `com.learning`.
    pub domain: String,
    /// HTTP listener port.
    pub port: u16,
    /// libSQL database file; `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    pub broker: BrokerConfig,
    pub retention: RetentionPolicy,
    /// How often the retention task runs.
    pub retention_interval: Duration,
    pub retry: RetryPolicy,
    /// Per-attempt delivery timeout.
    pub delivery_timeout: Duration,
    /// Category chosen when no classification rule matches.
    pub fallback_category: String,
    /// Optional JSON rule file; the built-in tables are used otherwise.
    pub rules_path: Option<PathBuf>,
    /// Destinations delivered over HTTP instead of in-process, as `(name, url)`.
    pub remote_endpoints: Vec<(String, String)>,
    /// Directory for daily-rolling log files.
    pub log_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            domain: "com.learning".to_string(),
            port: 8080,
            db_path: Some(PathBuf::from("./data/event-relay.db")),
            broker: BrokerConfig::default(),
            retention: RetentionPolicy::default(),
            retention_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            delivery_timeout: Duration::from_secs(5),
            fallback_category: crate::classifier::DEFAULT_FALLBACK.to_string(),
            rules_path: None,
            remote_endpoints: Vec::new(),
            log_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Load from `RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys take their defaults;
    /// set but unparsable numbers are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let domain = get("RELAY_DOMAIN").unwrap_or(defaults.domain);
        let domain_type = EventType::parse(&domain).map_err(|e| ConfigError::InvalidValue {
            key: "RELAY_DOMAIN".into(),
            message: e.to_string(),
        })?;

        let port = parse_or(&get, "RELAY_PORT", defaults.port)?;

        let db_path = match get("RELAY_DB_PATH") {
            Some(path) if path == MEMORY_DB => None,
            Some(path) => Some(PathBuf::from(path)),
            None => defaults.db_path,
        };

        let partitions: u32 = parse_or(&get, "RELAY_PARTITIONS", defaults.broker.partitions)?;
        if partitions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_PARTITIONS".into(),
                message: "must be at least 1".into(),
            });
        }
        let broker = BrokerConfig {
            partitions,
            // `<domain>.message.*` types share the `<domain>.message` topic.
            topic_depth: domain_type.segments().count() + 1,
            ..defaults.broker
        };

        let retention = RetentionPolicy {
            max_age: Some(Duration::from_secs(parse_or(
                &get,
                "RELAY_RETENTION_SECS",
                defaults.retention.max_age.map_or(86_400, |d| d.as_secs()),
            )?)),
            max_records: Some(parse_or(
                &get,
                "RELAY_RETENTION_MAX_RECORDS",
                defaults.retention.max_records.unwrap_or(100_000),
            )?),
        };
        let retention_secs: u64 = parse_or(
            &get,
            "RELAY_RETENTION_INTERVAL_SECS",
            defaults.retention_interval.as_secs(),
        )?;
        if retention_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_RETENTION_INTERVAL_SECS".into(),
                message: "must be at least 1".into(),
            });
        }
        let retention_interval = Duration::from_secs(retention_secs);

        let retry = RetryPolicy::default()
            .with_max_attempts(parse_or(&get, "RELAY_MAX_ATTEMPTS", defaults.retry.max_attempts)?)
            .with_base_delay(Duration::from_millis(parse_or(
                &get,
                "RELAY_RETRY_BASE_MS",
                defaults.retry.base_delay.as_millis() as u64,
            )?))
            .with_max_delay(Duration::from_millis(parse_or(
                &get,
                "RELAY_RETRY_MAX_MS",
                defaults.retry.max_delay.as_millis() as u64,
            )?));

        let delivery_timeout = Duration::from_millis(parse_or(
            &get,
            "RELAY_DELIVERY_TIMEOUT_MS",
            defaults.delivery_timeout.as_millis() as u64,
        )?);

        let fallback_category = get("RELAY_FALLBACK_CATEGORY").unwrap_or(defaults.fallback_category);
        crate::classifier::validate_category(&fallback_category)?;

        let remote_endpoints = match get("RELAY_REMOTE_ENDPOINTS") {
            Some(raw) => parse_endpoints(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            domain,
            port,
            db_path,
            broker,
            retention,
            retention_interval,
            retry,
            delivery_timeout,
            fallback_category,
            rules_path: get("RELAY_RULES_PATH").map(PathBuf::from),
            remote_endpoints,
            log_dir: get("RELAY_LOG_DIR").map(PathBuf::from),
        })
    }

    /// Prefix of every pipeline message type: `<domain>.message`.
    pub fn message_type(&self) -> Result<EventType, ConfigError> {
        EventType::parse(&format!("{}.message", self.domain)).map_err(|e| ConfigError::InvalidValue {
            key: "RELAY_DOMAIN".into(),
            message: e.to_string(),
        })
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

/// `name=url,name=url`.
fn parse_endpoints(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, url)) if !name.trim().is_empty() && !url.trim().is_empty() => {
                Ok((name.trim().to_string(), url.trim().to_string()))
            }
            _ => Err(ConfigError::InvalidValue {
                key: "RELAY_REMOTE_ENDPOINTS".into(),
                message: format!("expected name=url, got {pair:?}"),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.domain, "com.learning");
        assert_eq!(config.port, 8080);
        assert_eq!(config.broker.partitions, 3);
        assert_eq!(config.broker.topic_depth, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.fallback_category, "unknown");
        assert_eq!(config.message_type().unwrap().as_str(), "com.learning.message");
        assert!(config.remote_endpoints.is_empty());
    }

    #[test]
    fn overrides_and_memory_db() {
        let config = load(&[
            ("RELAY_DOMAIN", "org.acme.helpdesk"),
            ("RELAY_DB_PATH", ":memory:"),
            ("RELAY_MAX_ATTEMPTS", "5"),
            ("RELAY_RETRY_BASE_MS", "10"),
            ("RELAY_REMOTE_ENDPOINTS", "finance-handler=http://10.0.0.5:8080/, event-monitor=http://mon"),
        ])
        .unwrap();
        assert!(config.db_path.is_none());
        assert_eq!(config.broker.topic_depth, 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(10));
        assert_eq!(
            config.remote_endpoints,
            vec![
                ("finance-handler".to_string(), "http://10.0.0.5:8080/".to_string()),
                ("event-monitor".to_string(), "http://mon".to_string()),
            ]
        );
    }

    #[test]
    fn unparsable_numbers_are_errors() {
        let err = load(&[("RELAY_PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "RELAY_PORT"));
        assert!(load(&[("RELAY_PARTITIONS", "0")]).is_err());
    }

    #[test]
    fn zero_retention_interval_is_rejected() {
        let err = load(&[("RELAY_RETENTION_INTERVAL_SECS", "0")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "RELAY_RETENTION_INTERVAL_SECS"
        ));
        let config = load(&[("RELAY_RETENTION_INTERVAL_SECS", "1")]).unwrap();
        assert_eq!(config.retention_interval, Duration::from_secs(1));
    }

    #[test]
    fn rejects_bad_domain_category_and_endpoints() {
        assert!(load(&[("RELAY_DOMAIN", "com..learning")]).is_err());
        assert!(load(&[("RELAY_FALLBACK_CATEGORY", "not.valid")]).is_err());
        assert!(load(&[("RELAY_REMOTE_ENDPOINTS", "missing-url")]).is_err());
    }
}
