// ABOUTME: HTTP client for the external VPN gateway's credential lifecycle API
// ABOUTME: One bounded-timeout attempt per call; retry policy belongs to the calling worker
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::GatewayConfig;
use crate::errors::{AppError, AppResult};

/// Dependency name used in error classification and breaker registration
pub const GATEWAY_DEPENDENCY: &str = "gateway";

/// Credential issued by the gateway on a successful add call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionedCredential {
    /// Opaque credential identifier (echoes the locally generated one)
    pub credential_id: String,
    /// Connection payload handed to the owner
    pub secret_material: String,
}

/// VPN gateway API client
///
/// Stateless apart from the shared `reqwest` connection pool. Every failure
/// is classified transient (transport error, timeout, 5xx) or permanent
/// (contract violation); the client never retries internally so callers can
/// make state-aware retry decisions.
#[derive(Clone)]
pub struct GatewayClient {
    base_url: String,
    http_client: Client,
}

impl GatewayClient {
    /// Create a new gateway client with a bounded per-request timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: &GatewayConfig) -> AppResult<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            http_client,
        })
    }

    /// Register a credential at the gateway
    ///
    /// Not idempotent at the gateway: calling twice with the same
    /// `credential_id` is undefined and must never be done deliberately.
    ///
    /// # Errors
    ///
    /// Returns a transient or permanent dependency error per the
    /// classification above.
    pub async fn add_credential(
        &self,
        owner_id: &str,
        credential_id: &str,
        valid_until: DateTime<Utc>,
    ) -> AppResult<ProvisionedCredential> {
        let url = format!("{}/add-user", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&json!({
                "owner_id": owner_id,
                "credential_id": credential_id,
                "expiry_timestamp_ms": valid_until.timestamp_millis(),
            }))
            .send()
            .await
            .map_err(classify_transport_error)?;

        let response = check_status(response, "add-user")?;

        response
            .json::<ProvisionedCredential>()
            .await
            .map_err(|e| {
                AppError::permanent(
                    GATEWAY_DEPENDENCY,
                    format!("add-user returned malformed body: {e}"),
                )
            })
    }

    /// Remove a credential at the gateway
    ///
    /// Idempotent by contract: removing an already-absent credential
    /// returns success.
    ///
    /// # Errors
    ///
    /// Returns a classified dependency error on failure.
    pub async fn remove_credential(&self, credential_id: &str) -> AppResult<()> {
        let url = format!("{}/remove-user/{credential_id}", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .send()
            .await
            .map_err(classify_transport_error)?;

        check_status(response, "remove-user")?;
        Ok(())
    }

    /// Gateway liveness probe, surfaced through the health endpoint
    ///
    /// # Errors
    ///
    /// Returns a transient dependency error when the gateway is unreachable
    /// or unhealthy.
    pub async fn health_check(&self) -> AppResult<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(classify_transport_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AppError::transient(
                GATEWAY_DEPENDENCY,
                format!("Health probe returned HTTP {}", response.status()),
            ))
        }
    }
}

fn classify_transport_error(e: reqwest::Error) -> AppError {
    // Timeouts and connection failures are expected to recover
    AppError::transient(GATEWAY_DEPENDENCY, format!("Request failed: {e}"))
}

fn check_status(response: reqwest::Response, operation: &str) -> AppResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status.is_server_error() {
        Err(AppError::transient(
            GATEWAY_DEPENDENCY,
            format!("{operation} failed with HTTP {status}"),
        ))
    } else {
        Err(AppError::permanent(
            GATEWAY_DEPENDENCY,
            format!("{operation} rejected with HTTP {status}"),
        ))
    }
}
