//! Process configuration, read once from the environment at startup.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use hireloop_core::RetryPolicy;
use hireloop_events::DEFAULT_QUEUE_CHANNEL;
use hireloop_infra::event_bus::PublishMode;
use hireloop_infra::jobs::WorkerConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    /// Empty means every origin is allowed.
    pub allowed_origins: Vec<String>,
    pub queue_channel: String,
    pub event_mode: PublishMode,
    pub socket_buffer: usize,
    pub worker_enabled: bool,
    pub processor_url: Option<String>,
    pub worker: WorkerConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset and blank values take the default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let max_attempts: u32 = parse_or(&get, "WORKER_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::invalid("WORKER_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        let retry = RetryPolicy::exponential(
            max_attempts,
            millis_or(&get, "WORKER_BACKOFF_BASE_MS", 1000)?,
            millis_or(&get, "WORKER_BACKOFF_MAX_MS", 300_000)?,
        );

        let worker = WorkerConfig {
            name: "processor-worker".to_string(),
            poll_interval: millis_or(&get, "WORKER_POLL_INTERVAL_MS", 1000)?,
            batch_size: parse_or(&get, "WORKER_BATCH_SIZE", 5usize)?.max(1),
            retry,
            job_timeout: millis_or(&get, "WORKER_JOB_TIMEOUT_MS", 120_000)?,
            breaker_threshold: parse_or(&get, "WORKER_BREAKER_THRESHOLD", 5)?,
            breaker_cooldown: millis_or(&get, "WORKER_BREAKER_COOLDOWN_MS", 30_000)?,
            stale_after: millis_or(&get, "WORKER_STALE_AFTER_MS", 600_000)?,
        };
        if worker.poll_interval.is_zero() {
            return Err(ConfigError::invalid("WORKER_POLL_INTERVAL_MS", "0", "must be positive"));
        }
        // A live job must never look stale while its processor call is still allowed to run.
        if worker.stale_after <= worker.job_timeout {
            return Err(ConfigError::invalid(
                "WORKER_STALE_AFTER_MS",
                &worker.stale_after.as_millis().to_string(),
                "must be greater than WORKER_JOB_TIMEOUT_MS",
            ));
        }

        let event_mode = match get("QUEUE_EVENT_MODE") {
            Some(raw) => raw
                .parse::<PublishMode>()
                .map_err(|reason| ConfigError::invalid("QUEUE_EVENT_MODE", &raw, reason))?,
            None => PublishMode::default(),
        };

        let socket_buffer: usize = parse_or(&get, "SOCKET_BUFFER", 64)?;
        if socket_buffer == 0 {
            return Err(ConfigError::invalid("SOCKET_BUFFER", "0", "must be at least 1"));
        }

        Ok(Self {
            bind_addr: parse_or(&get, "BIND_ADDR", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?,
            port: parse_or(&get, "BRIDGE_PORT", 8081)?,
            redis_url: get("REDIS_URL"),
            database_url: get("DATABASE_URL"),
            allowed_origins: get("ALLOWED_ORIGINS")
                .map(|raw| parse_origins(&raw))
                .unwrap_or_default(),
            queue_channel: get("QUEUE_CHANNEL")
                .unwrap_or_else(|| DEFAULT_QUEUE_CHANNEL.to_string()),
            event_mode,
            socket_buffer,
            worker_enabled: parse_bool_or(&get, "WORKER_ENABLED", true)?,
            processor_url: get("UPLOAD_PROCESSOR_URL"),
            worker,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

/// Comma-separated origins, trimmed, without trailing slashes.
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|o| o.trim().trim_end_matches('/'))
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, &raw, e.to_string())),
        None => Ok(default),
    }
}

/// Upper bound for every `*_MS` setting (30 days).
pub const MAX_MILLIS: u64 = 30 * 24 * 60 * 60 * 1000;

fn millis_or<G>(get: &G, key: &'static str, default_ms: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let ms: u64 = parse_or(get, key, default_ms)?;
    if ms > MAX_MILLIS {
        return Err(ConfigError::invalid(
            key,
            &ms.to_string(),
            format!("must be at most {MAX_MILLIS}"),
        ));
    }
    Ok(Duration::from_millis(ms))
}

fn parse_bool_or<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, &raw, "expected true or false")),
    }
}
