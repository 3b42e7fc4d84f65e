use std::collections::HashMap;
use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use crate::notification::NotificationMethod;

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A dispatch must always finish before the lease it runs under expires.
    #[error(
        "dispatch timeout ({dispatch_timeout_ms}ms) must be shorter than the lease period ({lease_period_ms}ms)"
    )]
    InvalidDispatchTimeout {
        dispatch_timeout_ms: u64,
        lease_period_ms: u64,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Which durable queue implementation backs the dispatcher.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// `"memory"` (default) or `"postgres"`
    #[serde(default = "default_store_backend")]
    pub backend: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u32,
}

/// Tuning for the dispatch pipeline. Intervals are expressed in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    /// Delivery method new messages are enqueued with
    #[serde(default = "default_method")]
    pub method: NotificationMethod,
    /// Number of notifiers the manager spawns
    #[serde(default = "default_notifiers")]
    pub notifiers: usize,
    /// How often each notifier polls the store for new messages
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval_ms: u64,
    /// How long a leased message stays claimed before it becomes eligible again
    #[serde(default = "default_lease_period")]
    pub lease_period_ms: u64,
    /// Maximum number of messages leased per fetch
    #[serde(default = "default_lease_count")]
    pub lease_count: usize,
    /// Attempts after which a message is permanently failed
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    /// Minimum delay before a temporarily failed message is retried
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
    /// Upper bound on a single delivery attempt
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_ms: u64,
    /// How often buffered results are written back to the store
    #[serde(default = "default_store_sync_interval")]
    pub store_sync_interval_ms: u64,
    /// Capacity of each of the success/failure result buffers
    #[serde(default = "default_store_sync_buffer_size")]
    pub store_sync_buffer_size: usize,
    /// Upper bound on a graceful manager stop
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub helpers: TemplateHelpers,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    /// Endpoint which receives webhook notifications
    pub endpoint: Option<String>,
}

/// Deployment-wide values available to every template as `{{name}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateHelpers {
    #[serde(default = "default_access_url")]
    pub access_url: String,
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_store_backend() -> String {
    "memory".to_string()
}

fn default_database_url() -> String {
    "postgres://localhost:5432/ara".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u32 {
    5
}

fn default_idle_timeout() -> u32 {
    600
}

fn default_method() -> NotificationMethod {
    NotificationMethod::Webhook
}

fn default_notifiers() -> usize {
    1
}

fn default_fetch_interval() -> u64 {
    15_000 // 15 seconds
}

fn default_lease_period() -> u64 {
    120_000 // 2 minutes
}

fn default_lease_count() -> usize {
    20
}

fn default_max_send_attempts() -> u32 {
    5
}

fn default_retry_interval() -> u64 {
    300_000 // 5 minutes
}

fn default_dispatch_timeout() -> u64 {
    60_000 // 1 minute
}

fn default_store_sync_interval() -> u64 {
    2_000
}

fn default_store_sync_buffer_size() -> usize {
    50
}

fn default_stop_timeout() -> u64 {
    30_000
}

fn default_access_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_app_name() -> String {
    "Ara".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, SettingsError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", i64::from(default_port()))?
            .set_default("store.backend", default_store_backend())?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // ARA__NOTIFICATIONS__LEASE_COUNT, ARA__STORE__BACKEND, ...
            .add_source(
                Environment::with_prefix("ARA")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.notifications.validate()?;
        Ok(settings)
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl NotificationsConfig {
    /// Reject combinations the dispatch pipeline cannot honour.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.dispatch_timeout_ms >= self.lease_period_ms {
            return Err(SettingsError::InvalidDispatchTimeout {
                dispatch_timeout_ms: self.dispatch_timeout_ms,
                lease_period_ms: self.lease_period_ms,
            });
        }
        if self.lease_count == 0 {
            return Err(SettingsError::InvalidValue {
                field: "lease_count",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.store_sync_buffer_size == 0 {
            return Err(SettingsError::InvalidValue {
                field: "store_sync_buffer_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_send_attempts == 0 {
            return Err(SettingsError::InvalidValue {
                field: "max_send_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.fetch_interval_ms == 0 || self.store_sync_interval_ms == 0 {
            return Err(SettingsError::InvalidValue {
                field: "fetch_interval_ms/store_sync_interval_ms",
                reason: "intervals must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_ms)
    }

    pub fn lease_period(&self) -> Duration {
        Duration::from_millis(self.lease_period_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn store_sync_interval(&self) -> Duration {
        Duration::from_millis(self.store_sync_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl TemplateHelpers {
    /// Helper values keyed by the name templates refer to them with.
    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("access_url".to_string(), self.access_url.clone()),
            ("app_name".to_string(), self.app_name.clone()),
        ])
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            notifiers: default_notifiers(),
            fetch_interval_ms: default_fetch_interval(),
            lease_period_ms: default_lease_period(),
            lease_count: default_lease_count(),
            max_send_attempts: default_max_send_attempts(),
            retry_interval_ms: default_retry_interval(),
            dispatch_timeout_ms: default_dispatch_timeout(),
            store_sync_interval_ms: default_store_sync_interval(),
            store_sync_buffer_size: default_store_sync_buffer_size(),
            stop_timeout_ms: default_stop_timeout(),
            webhook: WebhookConfig::default(),
            helpers: TemplateHelpers::default(),
        }
    }
}

impl Default for TemplateHelpers {
    fn default() -> Self {
        Self {
            access_url: default_access_url(),
            app_name: default_app_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8082);

        let cfg = NotificationsConfig::default();
        assert_eq!(cfg.fetch_interval(), Duration::from_secs(15));
        assert_eq!(cfg.lease_period(), Duration::from_secs(120));
        assert_eq!(cfg.lease_count, 20);
        assert_eq!(cfg.max_send_attempts, 5);
        assert_eq!(cfg.store_sync_buffer_size, 50);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_dispatch_timeout_must_be_shorter_than_lease() {
        let cfg = NotificationsConfig {
            lease_period_ms: 1_000,
            dispatch_timeout_ms: 1_000,
            ..Default::default()
        };

        assert!(matches!(
            cfg.validate(),
            Err(SettingsError::InvalidDispatchTimeout { .. })
        ));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let cfg = NotificationsConfig {
            store_sync_buffer_size: 0,
            ..Default::default()
        };

        assert!(matches!(
            cfg.validate(),
            Err(SettingsError::InvalidValue { field: "store_sync_buffer_size", .. })
        ));
    }

    #[test]
    fn test_helpers_map() {
        let helpers = TemplateHelpers::default().to_map();
        assert_eq!(helpers.get("app_name").map(String::as_str), Some("Ara"));
        assert!(helpers.contains_key("access_url"));
    }
}
