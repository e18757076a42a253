// ABOUTME: Configuration management for the entitlement service
// ABOUTME: Environment-only configuration loaded once at startup
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

/// Environment-backed server configuration
pub mod environment;

pub use environment::{
    CircuitBreakerConfig, GatewayConfig, PaymentProviderConfig, ServerConfig, WorkerConfig,
};
