// ABOUTME: Entitlement lifecycle core for chat-sold, time-boxed VPN access
// ABOUTME: Transactional charge finalization plus activation, expiry, and renewal workers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

//! # Tollgate
//!
//! Tollgate turns confirmed payments into time-boxed VPN entitlements and
//! keeps them true over time. A charge is finalized exactly once inside a
//! database transaction; external side effects (gateway provisioning,
//! credential revocation) always happen outside transactions under claim
//! leases, with conditional updates absorbing every race. PostgreSQL row
//! locks are the only cross-process synchronization primitive.

#![deny(unsafe_code)]

/// Per-dependency circuit breakers
pub mod circuit_breaker;
/// Environment-driven configuration
pub mod config;
/// Shared dependency-injection context
pub mod context;
/// PostgreSQL store
pub mod database;
/// Unified error handling
pub mod errors;
/// Transactional charge finalization
pub mod finalizer;
/// VPN gateway HTTP client
pub mod gateway;
/// Structured logging setup
pub mod logging;
/// Data models
pub mod models;
/// Payment provider client, webhook verification, confirmation watcher
pub mod payments;
/// HTTP routes
pub mod routes;
/// Periodic background workers
pub mod workers;
