// canonsync/src/config.rs - Environment configuration, validated on startup

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PROCESSOR_NAME: &str = "canonsync";
const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 32;
const DEFAULT_SESSION_PREFETCH: usize = 20;
const DEFAULT_SESSION_IDLE_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_MAX_DELIVERY_COUNT: u32 = 5;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;
const DEFAULT_CHANGE_FEED_BATCH: usize = 100;
const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} not configured")]
    Missing(&'static str),
    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Tuning for the session consumer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// Upper bound on sessions (and therefore handler invocations) running at once
    pub max_concurrent_sessions: usize,
    /// Messages buffered per session ahead of the one being handled
    pub session_prefetch: usize,
    /// A session with no traffic for this long is closed and its slot reclaimed
    pub session_idle_timeout: Duration,
    /// Delivery attempt at which a retryable failure is dead-lettered instead of abandoned
    pub max_delivery_count: u32,
    /// Pause before the next attempt of an abandoned message, multiplied by the attempt number
    pub retry_backoff: Duration,
    /// How long in-flight handlers get to finish on shutdown
    pub shutdown_grace: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
            session_prefetch: DEFAULT_SESSION_PREFETCH,
            session_idle_timeout: Duration::from_millis(DEFAULT_SESSION_IDLE_TIMEOUT_MS),
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BaseConfiguration {
    /// Address of the NATS server (the queue namespace)
    pub nats_url: String,
    /// Credentials file for connecting to NATS
    pub creds_file: Option<String>,
    /// NKey seed for connecting to NATS
    pub nkey_seed: Option<String>,
    /// JetStream domain for the JS context
    pub js_domain: Option<String>,
    /// KV bucket holding canonical documents
    pub db_name: String,
    /// Key prefix of the canonical document type within the bucket
    pub container_name: String,
    /// Input queue carrying inbound envelopes
    pub queue_name: String,
    /// Output topic for republished canonical documents
    pub topic_name: String,
    /// Durable consumer / instance name
    pub processor_name: String,
    pub consumer: ConsumerSettings,
    pub change_feed_batch_size: usize,
    pub health_addr: String,
}

impl fmt::Debug for BaseConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseConfiguration")
            .field("nats_url", &self.nats_url)
            .field("creds_file", &self.creds_file)
            .field("nkey_seed", &self.nkey_seed.as_ref().map(|_| "***provided***"))
            .field("js_domain", &self.js_domain)
            .field("db_name", &self.db_name)
            .field("container_name", &self.container_name)
            .field("queue_name", &self.queue_name)
            .field("topic_name", &self.topic_name)
            .field("processor_name", &self.processor_name)
            .field("consumer", &self.consumer)
            .field("change_feed_batch_size", &self.change_feed_batch_size)
            .field("health_addr", &self.health_addr)
            .finish()
    }
}

impl BaseConfiguration {
    /// Read configuration from the process environment, failing on the first missing value
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an arbitrary lookup (used by tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let consumer = ConsumerSettings {
            max_concurrent_sessions: parsed(&lookup, "MAX_CONCURRENT_SESSIONS", DEFAULT_MAX_CONCURRENT_SESSIONS)?,
            session_prefetch: parsed(&lookup, "SESSION_PREFETCH", DEFAULT_SESSION_PREFETCH)?,
            session_idle_timeout: Duration::from_millis(parsed(
                &lookup,
                "SESSION_IDLE_TIMEOUT_MS",
                DEFAULT_SESSION_IDLE_TIMEOUT_MS,
            )?),
            max_delivery_count: parsed(&lookup, "MAX_DELIVERY_COUNT", DEFAULT_MAX_DELIVERY_COUNT)?,
            retry_backoff: Duration::from_millis(parsed(&lookup, "RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS)?),
            shutdown_grace: Duration::from_millis(parsed(&lookup, "SHUTDOWN_GRACE_MS", DEFAULT_SHUTDOWN_GRACE_MS)?),
        };
        if consumer.max_concurrent_sessions == 0 {
            return Err(ConfigError::Invalid {
                name: "MAX_CONCURRENT_SESSIONS",
                value: "0".to_string(),
            });
        }
        if consumer.session_prefetch == 0 {
            return Err(ConfigError::Invalid {
                name: "SESSION_PREFETCH",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            db_name: required(&lookup, "DB_NAME")?,
            container_name: required(&lookup, "DB_CONTAINER_ENGAGEMENT")?,
            nats_url: required(&lookup, "NATS_URL")?,
            topic_name: required(&lookup, "TOPIC_NAME")?,
            queue_name: required(&lookup, "QUEUE_NAME")?,
            creds_file: optional(&lookup, "NATS_CREDS_FILE"),
            nkey_seed: optional(&lookup, "NATS_NKEY_SEED"),
            js_domain: optional(&lookup, "NATS_JS_DOMAIN"),
            processor_name: optional(&lookup, "PROCESSOR_NAME")
                .unwrap_or_else(|| DEFAULT_PROCESSOR_NAME.to_string()),
            consumer,
            change_feed_batch_size: parsed(&lookup, "CHANGE_FEED_BATCH_SIZE", DEFAULT_CHANGE_FEED_BATCH)?,
            health_addr: optional(&lookup, "HEALTH_ADDR").unwrap_or_else(|| DEFAULT_HEALTH_ADDR.to_string()),
        })
    }

    pub fn log_summary(&self) {
        tracing::info!("📡 NATS Configuration:");
        tracing::info!("   URL: {}", self.nats_url);
        tracing::info!(
            "   Identity: {}",
            match (&self.creds_file, &self.nkey_seed) {
                (Some(_), _) => "credentials file",
                (None, Some(_)) => "nkey ***provided***",
                (None, None) => "anonymous",
            }
        );
        tracing::info!("   JS Domain: {}", self.js_domain.as_deref().unwrap_or("default"));
        tracing::info!(
            store.bucket = %self.db_name,
            store.container = %self.container_name,
            queue = %self.queue_name,
            topic = %self.topic_name,
            processor = %self.processor_name,
            sessions.max = self.consumer.max_concurrent_sessions,
            "Routing configuration"
        );
    }

    /// Get NATS connection using the configuration
    pub async fn get_nats_connection(&self) -> Result<async_nats::Client> {
        tracing::info!("🔌 Connecting to NATS at: {}", self.nats_url);

        let opts = match (&self.creds_file, &self.nkey_seed) {
            (Some(path), _) => async_nats::ConnectOptions::with_credentials_file(path)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read NATS credentials file {}: {}", path, e))?,
            (None, Some(seed)) => async_nats::ConnectOptions::with_nkey(seed.clone()),
            (None, None) => async_nats::ConnectOptions::default(),
        };

        let client = opts
            .name(self.processor_name.as_str())
            .max_reconnects(Some(60))
            .reconnect_delay_callback(|attempts| {
                Duration::from_millis(std::cmp::min((attempts as u64) * 100, 5000))
            })
            .connect(&self.nats_url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to NATS at {}: {}", self.nats_url, e))?;

        tracing::info!("✅ Successfully connected to NATS!");
        Ok(client)
    }

    /// Build a JetStream context on top of an existing connection
    pub fn jetstream_context(&self, nc: async_nats::Client) -> async_nats::jetstream::Context {
        if let Some(ref domain) = self.js_domain {
            tracing::info!("🚀 Creating JetStream context with domain: {}", domain);
            async_nats::jetstream::with_domain(nc, domain)
        } else {
            async_nats::jetstream::new(nc)
        }
    }
}

fn optional<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str) -> Option<String> {
    lookup(name).filter(|v| !v.trim().is_empty())
}

fn required<F: Fn(&str) -> Option<String>>(lookup: &F, name: &'static str) -> Result<String, ConfigError> {
    optional(lookup, name).ok_or(ConfigError::Missing(name))
}

fn parsed<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match optional(lookup, name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn minimal() -> HashMap<String, String> {
        env(&[
            ("DB_NAME", "DIH"),
            ("DB_CONTAINER_ENGAGEMENT", "engagement"),
            ("NATS_URL", "nats://127.0.0.1:4222"),
            ("TOPIC_NAME", "dih-engagement-out"),
            ("QUEUE_NAME", "dih-engagement-in"),
        ])
    }

    #[test]
    fn test_minimal_configuration_uses_defaults() {
        let vars = minimal();
        let config = BaseConfiguration::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.db_name, "DIH");
        assert_eq!(config.processor_name, "canonsync");
        assert_eq!(config.consumer, ConsumerSettings::default());
        assert_eq!(config.consumer.max_delivery_count, 5);
        assert_eq!(config.consumer.max_concurrent_sessions, 32);
    }

    #[test]
    fn test_missing_required_value_fails_fast() {
        let mut vars = minimal();
        vars.remove("QUEUE_NAME");
        let err = BaseConfiguration::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert_eq!(err, ConfigError::Missing("QUEUE_NAME"));
        assert_eq!(err.to_string(), "QUEUE_NAME not configured");
    }

    #[test]
    fn test_blank_value_counts_as_missing() {
        let mut vars = minimal();
        vars.insert("DB_NAME".into(), "  ".into());
        let err = BaseConfiguration::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DB_NAME"));
    }

    #[test]
    fn test_tuning_overrides_and_invalid_numbers() {
        let mut vars = minimal();
        vars.insert("MAX_CONCURRENT_SESSIONS".into(), "4".into());
        vars.insert("SESSION_IDLE_TIMEOUT_MS".into(), "250".into());
        vars.insert("RETRY_BACKOFF_MS".into(), "15".into());
        let config = BaseConfiguration::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.consumer.max_concurrent_sessions, 4);
        assert_eq!(config.consumer.session_idle_timeout, Duration::from_millis(250));
        assert_eq!(config.consumer.retry_backoff, Duration::from_millis(15));

        vars.insert("MAX_DELIVERY_COUNT".into(), "five".into());
        let err = BaseConfiguration::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "MAX_DELIVERY_COUNT", .. }));
    }

    #[test]
    fn test_debug_output_redacts_seed() {
        let mut vars = minimal();
        vars.insert("NATS_NKEY_SEED".into(), "SUAMYSECRET".into());
        let config = BaseConfiguration::from_lookup(|k| vars.get(k).cloned()).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("SUAMYSECRET"));
        assert!(rendered.contains("***provided***"));
    }
}
