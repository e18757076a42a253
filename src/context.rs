// ABOUTME: Focused dependency injection context shared by workers and HTTP routes
// ABOUTME: Bundles the database, gateway client, breaker registry, and configuration
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use std::sync::Arc;

use crate::circuit_breaker::BreakerRegistry;
use crate::config::ServerConfig;
use crate::database::{Database, STORE_DEPENDENCY};
use crate::errors::AppResult;
use crate::gateway::{GatewayClient, GATEWAY_DEPENDENCY};
use crate::payments::{PaymentProviderClient, PAYMENTS_DEPENDENCY};

/// Shared server resources, cloned cheaply into every worker and route
#[derive(Clone)]
pub struct ServerResources {
    /// Entitlement store
    pub database: Database,
    /// Provisioning gateway client
    pub gateway: GatewayClient,
    /// Payment provider client (watcher polling)
    pub payments: PaymentProviderClient,
    /// Per-dependency circuit breakers
    pub breakers: Arc<BreakerRegistry>,
    /// Startup configuration
    pub config: Arc<ServerConfig>,
}

impl ServerResources {
    /// Assemble server resources from configuration and a connected database
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built.
    pub fn new(config: ServerConfig, database: Database) -> AppResult<Self> {
        let gateway = GatewayClient::new(&config.gateway)?;
        let payments = PaymentProviderClient::new(&config.payments)?;
        let breakers = Arc::new(BreakerRegistry::new(
            &config.breaker,
            &[GATEWAY_DEPENDENCY, PAYMENTS_DEPENDENCY, STORE_DEPENDENCY],
        ));

        Ok(Self {
            database,
            gateway,
            payments,
            breakers,
            config: Arc::new(config),
        })
    }
}
