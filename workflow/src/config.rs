//! Configuration for the workflow service.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::audit::HmacAuditSigner;
use crate::events::EVENT_TOPIC;
use benefits_runtime::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Development signing key used when `AUDIT_SIGNING_KEY` is not set.
const DEV_SIGNING_KEY: &str = "dev-audit-signing-key-change-me";

/// Configuration rejected by [`WorkflowConfig::validate`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric setting is out of range
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Setting name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Audit signing
    pub audit: AuditConfig,
    /// Event publishing
    pub events: EventsConfig,
    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

/// Audit signing configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// HMAC-SHA256 key; empty disables signing
    pub signing_key: String,
    /// Identifier stored with each signature
    pub key_id: String,
}

impl std::fmt::Debug for AuditConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditConfig")
            .field("signing_key", &"<redacted>")
            .field("key_id", &self.key_id)
            .finish()
    }
}

/// Event publishing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Topic for request events
    pub topic: String,
    /// Retries before an event is dead-lettered
    pub max_retries: u32,
    /// Initial backoff in milliseconds
    pub initial_delay_ms: u64,
    /// Backoff cap in milliseconds
    pub max_delay_ms: u64,
    /// Dead-letter queue capacity
    pub dlq_max_size: usize,
}

/// Logging and metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log filter (trace, debug, info, warn, error)
    pub log_level: String,
    /// Start the Prometheus exporter
    pub metrics_enabled: bool,
    /// Metrics server host (for Prometheus scraping)
    pub metrics_host: String,
    /// Metrics server port
    pub metrics_port: u16,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl WorkflowConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Missing or unparsable values fall back to defaults.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = &lookup;
        Self {
            audit: AuditConfig {
                signing_key: lookup("AUDIT_SIGNING_KEY").unwrap_or_else(|| DEV_SIGNING_KEY.to_string()),
                key_id: lookup("AUDIT_KEY_ID").unwrap_or_else(|| "audit-key-1".to_string()),
            },
            events: EventsConfig {
                topic: lookup("EVENT_TOPIC").unwrap_or_else(|| EVENT_TOPIC.to_string()),
                max_retries: parsed(lookup, "EVENT_PUBLISH_MAX_RETRIES").unwrap_or(5),
                initial_delay_ms: parsed(lookup, "EVENT_PUBLISH_INITIAL_DELAY_MS").unwrap_or(100),
                max_delay_ms: parsed(lookup, "EVENT_PUBLISH_MAX_DELAY_MS").unwrap_or(10_000),
                dlq_max_size: parsed(lookup, "EVENT_DLQ_MAX_SIZE").unwrap_or(1000),
            },
            observability: ObservabilityConfig {
                log_level: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
                metrics_enabled: parsed(lookup, "METRICS_ENABLED").unwrap_or(false),
                metrics_host: lookup("METRICS_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                metrics_port: parsed(lookup, "METRICS_PORT").unwrap_or(9090),
            },
        }
    }

    /// Reject settings the relay cannot work with.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for a zero retry budget, zero or inverted
    /// backoff bounds, a zero dead-letter capacity or an unparsable metrics host.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let events = &self.events;
        if events.max_retries == 0 {
            return Err(invalid("EVENT_PUBLISH_MAX_RETRIES", "must be at least 1"));
        }
        if events.initial_delay_ms == 0 {
            return Err(invalid("EVENT_PUBLISH_INITIAL_DELAY_MS", "must be positive"));
        }
        if events.max_delay_ms < events.initial_delay_ms {
            return Err(invalid(
                "EVENT_PUBLISH_MAX_DELAY_MS",
                format!(
                    "{} is below the initial delay of {}",
                    events.max_delay_ms, events.initial_delay_ms
                ),
            ));
        }
        if events.dlq_max_size == 0 {
            return Err(invalid("EVENT_DLQ_MAX_SIZE", "must be at least 1"));
        }
        if self.observability.metrics_enabled {
            self.metrics_addr()?;
        }
        Ok(())
    }

    /// Backoff policy for event publishing.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.events.max_retries)
            .initial_delay(Duration::from_millis(self.events.initial_delay_ms))
            .max_delay(Duration::from_millis(self.events.max_delay_ms))
            .build()
    }

    /// Audit signer for the configured key. An empty key yields a signer
    /// that always fails, so entries fall back to content hashes.
    #[must_use]
    pub fn signer(&self) -> HmacAuditSigner {
        if self.audit.signing_key.is_empty() {
            tracing::warn!(target: "audit", "AUDIT_SIGNING_KEY is empty; audit entries will be unsigned");
        }
        HmacAuditSigner::new(self.audit.key_id.clone(), self.audit.signing_key.as_bytes())
    }

    /// Address of the Prometheus exporter.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if the host is not an IP address.
    pub fn metrics_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host: IpAddr = self
            .observability
            .metrics_host
            .parse()
            .map_err(|e| invalid("METRICS_HOST", format!("{e}")))?;
        Ok(SocketAddr::new(host, self.observability.metrics_port))
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.trim().parse().ok())
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
