// ABOUTME: Tests for environment-driven configuration loading and validation
// ABOUTME: Serialized because they mutate process-wide environment variables
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

use std::env;
use std::time::Duration;

use serial_test::serial;
use tollgate::config::ServerConfig;

fn set_required_vars() {
    env::set_var("DATABASE_URL", "postgresql://localhost:5432/tollgate");
    env::set_var("TOLLGATE_GATEWAY_URL", "http://gateway.example:8080");
    env::set_var("TOLLGATE_PAYMENT_PROVIDER_URL", "http://payments.example");
    env::set_var("TOLLGATE_WEBHOOK_SECRET", "secret");
}

fn clear_all_vars() {
    for (key, _) in env::vars() {
        if key.starts_with("TOLLGATE_") {
            env::remove_var(&key);
        }
    }
    env::remove_var("DATABASE_URL");
}

#[test]
#[serial]
fn test_from_env_with_defaults() {
    clear_all_vars();
    set_required_vars();

    let config = ServerConfig::from_env().expect("Config should load");
    assert_eq!(config.http_port, 8091);
    assert_eq!(config.database_max_connections, 20);
    assert!(config.gateway.provisioning_enabled);
    assert_eq!(config.workers.batch_size, 25);
    assert_eq!(config.workers.renewal_period_days, 30);
    assert_eq!(config.payments.charge_ttl, Duration::from_secs(1800));
    assert_eq!(config.breaker.failure_threshold, 5);
}

#[test]
#[serial]
fn test_from_env_missing_required_fails() {
    clear_all_vars();
    set_required_vars();
    env::remove_var("TOLLGATE_WEBHOOK_SECRET");

    let err = ServerConfig::from_env().expect_err("Missing secret must fail");
    assert!(err.to_string().contains("TOLLGATE_WEBHOOK_SECRET"));
}

#[test]
#[serial]
fn test_from_env_overrides_and_validation() {
    clear_all_vars();
    set_required_vars();
    env::set_var("TOLLGATE_PROVISIONING_ENABLED", "false");
    env::set_var("TOLLGATE_RENEWAL_PRICE", "2500");
    env::set_var("TOLLGATE_ACTIVATION_INTERVAL_SECS", "3");

    let config = ServerConfig::from_env().expect("Config should load");
    assert!(!config.gateway.provisioning_enabled);
    assert_eq!(config.workers.renewal_price, 2500);
    assert_eq!(config.workers.activation_interval, Duration::from_secs(3));

    // An undersized pool cannot serve four workers plus request handlers
    env::set_var("TOLLGATE_DATABASE_MAX_CONNECTIONS", "2");
    assert!(ServerConfig::from_env().is_err());
    env::remove_var("TOLLGATE_DATABASE_MAX_CONNECTIONS");

    env::set_var("TOLLGATE_WORKER_BATCH_SIZE", "not_a_number");
    assert!(ServerConfig::from_env().is_err());

    clear_all_vars();
}
