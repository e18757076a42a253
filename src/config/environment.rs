// ABOUTME: Environment variable configuration with validated defaults
// ABOUTME: All tunables use the TOLLGATE_ prefix; DATABASE_URL follows sqlx convention
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{AppError, AppResult};

/// Provisioning gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the external VPN gateway
    pub base_url: String,
    /// Per-request timeout for gateway calls
    pub request_timeout: Duration,
    /// Explicit operator switch: when false, provisioning failures are
    /// permanent. Attempt counts never flip this on their own.
    pub provisioning_enabled: bool,
}

/// Payment provider configuration
#[derive(Debug, Clone)]
pub struct PaymentProviderConfig {
    /// Base URL of the payment provider API (polled by the watcher)
    pub base_url: String,
    /// Shared secret for webhook HMAC-SHA256 signatures
    pub webhook_secret: String,
    /// Per-request timeout for provider calls
    pub request_timeout: Duration,
    /// How long an unpaid charge stays payable before it is abandoned
    pub charge_ttl: Duration,
}

/// Periodic worker scheduling configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Activation worker poll interval
    pub activation_interval: Duration,
    /// Expiry worker poll interval
    pub expiry_interval: Duration,
    /// Renewal worker poll interval
    pub renewal_interval: Duration,
    /// Payment watcher poll interval
    pub watcher_interval: Duration,
    /// Maximum rows claimed per iteration
    pub batch_size: i64,
    /// Hard wall-clock budget for one whole worker iteration
    pub iteration_timeout: Duration,
    /// Minimum delay after a failed iteration, preventing tight retry storms
    pub min_retry_delay: Duration,
    /// Active entitlements expiring within this window are renewal candidates
    pub renewal_lookahead: Duration,
    /// Length of one prepaid renewal period, in days
    pub renewal_period_days: i32,
    /// Price of one renewal period in minor currency units
    pub renewal_price: i64,
    /// Attempt ceiling recorded for observability; exceeding it never marks
    /// a pending row as failed while provisioning stays enabled
    pub max_provisioning_attempts: i32,
}

/// Circuit breaker thresholds, shared by all dependency breakers
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Time an open breaker waits before allowing a half-open probe
    pub cooldown: Duration,
}

/// Complete server configuration, loaded once at startup
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// PostgreSQL connection string
    pub database_url: String,
    /// Maximum database pool size; must exceed the worker count plus
    /// expected concurrent request handlers
    pub database_max_connections: u32,
    /// HTTP listen port
    pub http_port: u16,
    /// Gateway settings
    pub gateway: GatewayConfig,
    /// Payment provider settings
    pub payments: PaymentProviderConfig,
    /// Worker scheduling
    pub workers: WorkerConfig,
    /// Breaker thresholds
    pub breaker: CircuitBreakerConfig,
}

fn env_or<T>(key: &str, default: T) -> AppResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| AppError::config(format!("Invalid value for {key}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_required(key: &str) -> AppResult<String> {
    env::var(key).map_err(|_| AppError::config(format!("{key} must be set")))
}

fn env_secs(key: &str, default_secs: u64) -> AppResult<Duration> {
    Ok(Duration::from_secs(env_or(key, default_secs)?))
}

impl ServerConfig {
    /// Load configuration from the environment
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value fails
    /// to parse.
    pub fn from_env() -> AppResult<Self> {
        let workers = WorkerConfig {
            activation_interval: env_secs("TOLLGATE_ACTIVATION_INTERVAL_SECS", 10)?,
            expiry_interval: env_secs("TOLLGATE_EXPIRY_INTERVAL_SECS", 60)?,
            renewal_interval: env_secs("TOLLGATE_RENEWAL_INTERVAL_SECS", 300)?,
            watcher_interval: env_secs("TOLLGATE_WATCHER_INTERVAL_SECS", 30)?,
            batch_size: env_or("TOLLGATE_WORKER_BATCH_SIZE", 25)?,
            iteration_timeout: env_secs("TOLLGATE_ITERATION_TIMEOUT_SECS", 120)?,
            min_retry_delay: env_secs("TOLLGATE_MIN_RETRY_DELAY_SECS", 5)?,
            renewal_lookahead: env_secs("TOLLGATE_RENEWAL_LOOKAHEAD_SECS", 6 * 3600)?,
            renewal_period_days: env_or("TOLLGATE_RENEWAL_PERIOD_DAYS", 30)?,
            renewal_price: env_or("TOLLGATE_RENEWAL_PRICE", 1000)?,
            max_provisioning_attempts: env_or("TOLLGATE_MAX_PROVISIONING_ATTEMPTS", 20)?,
        };

        let config = Self {
            database_url: env_required("DATABASE_URL")?,
            database_max_connections: env_or("TOLLGATE_DATABASE_MAX_CONNECTIONS", 20)?,
            http_port: env_or("TOLLGATE_HTTP_PORT", 8091)?,
            gateway: GatewayConfig {
                base_url: env_required("TOLLGATE_GATEWAY_URL")?,
                request_timeout: env_secs("TOLLGATE_GATEWAY_TIMEOUT_SECS", 10)?,
                provisioning_enabled: env_or("TOLLGATE_PROVISIONING_ENABLED", true)?,
            },
            payments: PaymentProviderConfig {
                base_url: env_required("TOLLGATE_PAYMENT_PROVIDER_URL")?,
                webhook_secret: env_required("TOLLGATE_WEBHOOK_SECRET")?,
                request_timeout: env_secs("TOLLGATE_PAYMENT_TIMEOUT_SECS", 10)?,
                charge_ttl: env_secs("TOLLGATE_CHARGE_TTL_SECS", 30 * 60)?,
            },
            workers,
            breaker: CircuitBreakerConfig {
                failure_threshold: env_or("TOLLGATE_BREAKER_FAILURE_THRESHOLD", 5)?,
                success_threshold: env_or("TOLLGATE_BREAKER_SUCCESS_THRESHOLD", 2)?,
                cooldown: env_secs("TOLLGATE_BREAKER_COOLDOWN_SECS", 30)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.database_max_connections < 8 {
            return Err(AppError::config(
                "TOLLGATE_DATABASE_MAX_CONNECTIONS must be at least 8 (four workers plus request handlers share the pool)",
            ));
        }
        if self.workers.batch_size <= 0 {
            return Err(AppError::config(
                "TOLLGATE_WORKER_BATCH_SIZE must be positive",
            ));
        }
        if self.workers.renewal_period_days <= 0 {
            return Err(AppError::config(
                "TOLLGATE_RENEWAL_PERIOD_DAYS must be positive",
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(AppError::config("Breaker thresholds must be positive"));
        }
        Ok(())
    }
}
