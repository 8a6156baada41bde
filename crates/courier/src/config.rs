//! Dispatcher, consumer and connection settings.
//!
//! Durations serialize as integer milliseconds so the structs can be loaded
//! from any serde format the host already uses.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CourierError, Result};

/// Outbox dispatcher settings.
///
/// `lease_duration` must exceed the worst case time to send and record a whole
/// batch, otherwise a live dispatcher can lose its own lease mid-batch and race
/// another instance. [`validate`](Self::validate) enforces this against
/// `send_timeout * batch_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    pub batch_size: usize,
    #[serde(rename = "lease_duration_ms", with = "millis")]
    pub lease_duration: Duration,
    #[serde(rename = "send_timeout_ms", with = "millis")]
    pub send_timeout: Duration,
    pub max_attempts: u32,
    #[serde(rename = "retry_base_delay_ms", with = "millis")]
    pub retry_base_delay: Duration,
    #[serde(rename = "retry_max_delay_ms", with = "millis")]
    pub retry_max_delay: Duration,
    /// Zero disables resend suppression.
    #[serde(rename = "duplicate_detection_window_ms", with = "millis")]
    pub duplicate_detection_window: Duration,
    #[serde(rename = "shutdown_grace_ms", with = "millis")]
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
            lease_duration: Duration::from_secs(60),
            send_timeout: Duration::from_secs(1),
            max_attempts: 5,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(3600),
            duplicate_detection_window: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl DispatcherConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn with_duplicate_detection_window(mut self, window: Duration) -> Self {
        self.duplicate_detection_window = window;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Defaults overlaid with any `COURIER_*` variables present, validated.
    ///
    /// Recognized: `COURIER_POLL_INTERVAL_MS`, `COURIER_BATCH_SIZE`,
    /// `COURIER_LEASE_DURATION_MS`, `COURIER_SEND_TIMEOUT_MS`,
    /// `COURIER_MAX_ATTEMPTS`, `COURIER_DUPLICATE_DETECTION_WINDOW_MS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = env_number("COURIER_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(size) = env_number("COURIER_BATCH_SIZE")? {
            config.batch_size = size as usize;
        }
        if let Some(ms) = env_number("COURIER_LEASE_DURATION_MS")? {
            config.lease_duration = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("COURIER_SEND_TIMEOUT_MS")? {
            config.send_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = env_number("COURIER_MAX_ATTEMPTS")? {
            config.max_attempts = u32::try_from(max)
                .map_err(|_| CourierError::config("COURIER_MAX_ATTEMPTS too large"))?;
        }
        if let Some(ms) = env_number("COURIER_DUPLICATE_DETECTION_WINDOW_MS")? {
            config.duplicate_detection_window = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(CourierError::config("poll_interval must be positive"));
        }
        if self.batch_size == 0 {
            return Err(CourierError::config("batch_size must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(CourierError::config("max_attempts must be at least 1"));
        }
        if self.send_timeout.is_zero() {
            return Err(CourierError::config("send_timeout must be positive"));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(CourierError::config(
                "retry_base_delay must not exceed retry_max_delay",
            ));
        }
        let worst_case_batch = u32::try_from(self.batch_size)
            .ok()
            .and_then(|size| self.send_timeout.checked_mul(size));
        match worst_case_batch {
            Some(worst) if self.lease_duration > worst => Ok(()),
            _ => Err(CourierError::config(format!(
                "lease_duration ({:?}) must exceed send_timeout * batch_size ({:?} * {})",
                self.lease_duration, self.send_timeout, self.batch_size
            ))),
        }
    }
}

/// Consumer worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Maximum deliveries handled at once.
    pub concurrency: usize,
    #[serde(rename = "shutdown_grace_ms", with = "millis")]
    pub shutdown_grace: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ConsumerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(CourierError::config("concurrency must be at least 1"));
        }
        Ok(())
    }
}

/// Connection targets. Courier never dials these itself; hosts hand them to
/// whatever broker and storage clients they construct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub broker_endpoint: String,
    pub storage_endpoint: String,
}

impl ConnectionConfig {
    pub const BROKER_ENV: &'static str = "COURIER_BROKER_ENDPOINT";
    pub const STORAGE_ENV: &'static str = "COURIER_STORAGE_ENDPOINT";

    /// Read both endpoints from the environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            broker_endpoint: required_env(Self::BROKER_ENV)?,
            storage_endpoint: required_env(Self::STORAGE_ENV)?,
        })
    }
}

fn required_env(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(CourierError::config(format!("{name} is missing"))),
    }
}

fn env_number(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| CourierError::config(format!("{name}: {err}"))),
        Err(_) => Ok(None),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
