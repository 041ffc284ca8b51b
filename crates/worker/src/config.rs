//! Worker configuration: defaults, builders, validation and environment loading.

use core::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1_000);
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_TICKS: u32 = 60;
pub const DEFAULT_SUBSCRIBE_RETRIES: u32 = 3;
pub const DEFAULT_SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Environment variable names read by [`WorkerConfig::from_env`].
pub mod env {
    pub const QUEUE: &str = "JOBWORKER_QUEUE";
    pub const JOB_TIMEOUT_MS: &str = "JOBWORKER_JOB_TIMEOUT_MS";
    pub const MAX_ATTEMPTS: &str = "JOBWORKER_MAX_ATTEMPTS";
    pub const TICK_INTERVAL_MS: &str = "JOBWORKER_TICK_INTERVAL_MS";
    pub const MAX_TICKS: &str = "JOBWORKER_MAX_TICKS";
    pub const REALTIME_ENABLED: &str = "JOBWORKER_REALTIME_ENABLED";
    pub const SUBSCRIBE_RETRIES: &str = "JOBWORKER_SUBSCRIBE_RETRIES";
    pub const SUBSCRIBE_RETRY_DELAY_MS: &str = "JOBWORKER_SUBSCRIBE_RETRY_DELAY_MS";
    pub const SUBSCRIBE_TIMEOUT_MS: &str = "JOBWORKER_SUBSCRIBE_TIMEOUT_MS";
    pub const ON_SUBSCRIPTION_EXHAUSTED: &str = "JOBWORKER_ON_SUBSCRIPTION_EXHAUSTED";
}

/// What a worker does once the push channel has failed more often than
/// `subscribe_retries` allows.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum SubscriptionFallback {
    /// Stop the worker.
    #[default]
    Stop,
    /// Keep running on the tick backstop alone.
    PollOnly,
}

impl FromStr for SubscriptionFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            s if s.eq_ignore_ascii_case("stop") => Ok(SubscriptionFallback::Stop),
            s if s.eq_ignore_ascii_case("poll-only") || s.eq_ignore_ascii_case("poll_only") => {
                Ok(SubscriptionFallback::PollOnly)
            }
            _ => Err("expected `stop` or `poll-only`".to_string()),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Queue to claim from.
    pub queue: String,
    /// How long the worker waits for a handler before recording a timeout.
    pub job_timeout: Duration,
    /// Default attempt ceiling; jobs may override it.
    pub max_attempts: u32,
    /// Idle sleep between checks.
    pub tick_interval: Duration,
    /// Idle ticks before a forced re-check. 0 disables the polling backstop.
    pub max_ticks: u32,
    pub realtime_enabled: bool,
    pub subscribe_retries: u32,
    pub subscribe_retry_delay: Duration,
    pub subscribe_timeout: Duration,
    pub on_subscription_exhausted: SubscriptionFallback,
}

impl WorkerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_ticks: DEFAULT_MAX_TICKS,
            realtime_enabled: true,
            subscribe_retries: DEFAULT_SUBSCRIBE_RETRIES,
            subscribe_retry_delay: DEFAULT_SUBSCRIBE_RETRY_DELAY,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            on_subscription_exhausted: SubscriptionFallback::Stop,
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_max_ticks(mut self, max_ticks: u32) -> Self {
        self.max_ticks = max_ticks;
        self
    }

    pub fn with_realtime(mut self, enabled: bool) -> Self {
        self.realtime_enabled = enabled;
        self
    }

    pub fn with_subscribe_retries(mut self, retries: u32) -> Self {
        self.subscribe_retries = retries;
        self
    }

    pub fn with_subscribe_retry_delay(mut self, delay: Duration) -> Self {
        self.subscribe_retry_delay = delay;
        self
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    pub fn with_subscription_fallback(mut self, fallback: SubscriptionFallback) -> Self {
        self.on_subscription_exhausted = fallback;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.trim().is_empty() {
            return Err(ConfigError::MissingRequired("queue"));
        }
        if self.max_attempts < 1 {
            return Err(ConfigError::invalid(
                "max_attempts",
                self.max_attempts,
                "must be at least 1",
            ));
        }
        if self.tick_interval < MIN_TICK_INTERVAL {
            return Err(ConfigError::invalid(
                "tick_interval",
                format!("{:?}", self.tick_interval),
                format!("must be at least {MIN_TICK_INTERVAL:?}"),
            ));
        }
        if self.subscribe_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "subscribe_timeout",
                format!("{:?}", self.subscribe_timeout),
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Load from the process environment. See [`env`] for variable names.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue = lookup(env::QUEUE)
            .filter(|q| !q.trim().is_empty())
            .ok_or(ConfigError::MissingRequired(env::QUEUE))?;

        let mut config = Self::new(queue);
        if let Some(ms) = parse_var::<u64, _>(&lookup, env::JOB_TIMEOUT_MS)? {
            config.job_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, env::MAX_ATTEMPTS)? {
            config.max_attempts = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, env::TICK_INTERVAL_MS)? {
            config.tick_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, env::MAX_TICKS)? {
            config.max_ticks = n;
        }
        if let Some(raw) = lookup(env::REALTIME_ENABLED) {
            config.realtime_enabled = parse_bool(env::REALTIME_ENABLED, &raw)?;
        }
        if let Some(n) = parse_var(&lookup, env::SUBSCRIBE_RETRIES)? {
            config.subscribe_retries = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, env::SUBSCRIBE_RETRY_DELAY_MS)? {
            config.subscribe_retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, env::SUBSCRIBE_TIMEOUT_MS)? {
            config.subscribe_timeout = Duration::from_millis(ms);
        }
        if let Some(fallback) = parse_var(&lookup, env::ON_SUBSCRIPTION_EXHAUSTED)? {
            config.on_subscription_exhausted = fallback;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::invalid(key, &raw, e.to_string())),
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, raw, "expected a boolean")),
    }
}
