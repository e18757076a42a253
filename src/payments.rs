// ABOUTME: Payment provider client, webhook signature verification, and confirmation watcher
// ABOUTME: The watcher is the backstop confirmation path when webhooks are lost
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use async_trait::async_trait;
use reqwest::Client;
use ring::hmac;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::PaymentProviderConfig;
use crate::context::ServerResources;
use crate::errors::{AppError, AppResult};
use crate::finalizer::ChargeFinalizer;
use crate::models::PendingCharge;
use crate::workers::Worker;

/// Dependency name used in error classification and breaker registration
pub const PAYMENTS_DEPENDENCY: &str = "payments";

/// Invoice state reported by the provider's polling API
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderInvoice {
    /// Provider-side invoice status (`paid` triggers finalization)
    pub status: String,
    /// Amount the provider actually collected, in minor currency units
    pub amount: i64,
    /// Provider-side payment reference for the receipt
    pub payment_reference: Option<String>,
}

/// Webhook body the provider posts on payment events
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentWebhook {
    /// Charge id issued by `create_pending_charge`
    pub charge_id: String,
    /// Amount collected, in minor currency units
    pub amount: i64,
    /// Provider-side payment reference
    pub payment_reference: Option<String>,
}

/// Payment provider API client
///
/// Polling only; webhook delivery arrives through the HTTP routes. Failure
/// classification mirrors the gateway client: transport errors and 5xx are
/// transient, everything else permanent.
#[derive(Clone)]
pub struct PaymentProviderClient {
    base_url: String,
    http_client: Client,
}

impl PaymentProviderClient {
    /// Create a provider client with a bounded per-request timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: &PaymentProviderConfig) -> AppResult<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            http_client,
        })
    }

    /// Fetch the current state of a provider-side invoice
    ///
    /// # Errors
    ///
    /// Returns a classified dependency error on failure.
    pub async fn get_invoice(&self, provider_reference: &str) -> AppResult<ProviderInvoice> {
        let url = format!("{}/invoices/{provider_reference}", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::transient(PAYMENTS_DEPENDENCY, format!("Request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AppError::transient(
                PAYMENTS_DEPENDENCY,
                format!("Invoice lookup failed with HTTP {status}"),
            ));
        }
        if !status.is_success() {
            return Err(AppError::permanent(
                PAYMENTS_DEPENDENCY,
                format!("Invoice lookup rejected with HTTP {status}"),
            ));
        }

        response.json::<ProviderInvoice>().await.map_err(|e| {
            AppError::permanent(
                PAYMENTS_DEPENDENCY,
                format!("Invoice lookup returned malformed body: {e}"),
            )
        })
    }
}

/// Verify the provider's HMAC-SHA256 webhook signature over the raw body
///
/// The signature header carries a lowercase hex digest; verification is
/// constant-time via `ring`.
///
/// # Errors
///
/// Returns `InvalidInput` when the signature is malformed or does not match.
pub fn verify_webhook_signature(
    webhook_secret: &str,
    body: &[u8],
    signature_hex: &str,
) -> AppResult<()> {
    let signature = hex::decode(signature_hex.trim())
        .map_err(|_| AppError::invalid_input("Malformed webhook signature"))?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, webhook_secret.as_bytes());
    hmac::verify(&key, body, &signature)
        .map_err(|_| AppError::invalid_input("Webhook signature mismatch"))
}

/// Polls the provider for confirmations the webhook path never delivered,
/// and abandons unpaid charges past their TTL
pub struct PaymentWatcher {
    resources: ServerResources,
    finalizer: ChargeFinalizer,
}

impl PaymentWatcher {
    /// Create the payment watcher
    #[must_use]
    pub fn new(resources: ServerResources) -> Self {
        let finalizer = ChargeFinalizer::new(resources.clone());
        Self {
            resources,
            finalizer,
        }
    }

    async fn poll_one(&self, charge: &PendingCharge) -> AppResult<()> {
        let Some(provider_reference) = charge.provider_reference.as_deref() else {
            return Ok(());
        };

        let breaker = self.resources.breakers.get(PAYMENTS_DEPENDENCY);
        if !breaker.allow_request() {
            return Ok(());
        }

        let invoice = match self.resources.payments.get_invoice(provider_reference).await {
            Ok(invoice) => {
                breaker.record_success();
                invoice
            }
            Err(e) => {
                if e.is_transient() {
                    breaker.record_failure();
                }
                warn!(
                    charge_id = charge.charge_id,
                    error = %e,
                    "Invoice poll failed"
                );
                return Ok(());
            }
        };

        if invoice.status != "paid" {
            return Ok(());
        }

        match self
            .finalizer
            .finalize(
                &charge.charge_id,
                invoice.amount,
                invoice.payment_reference.as_deref(),
            )
            .await
        {
            Ok(outcome) => {
                info!(
                    charge_id = charge.charge_id,
                    ?outcome,
                    "Watcher finalized charge missed by webhooks"
                );
            }
            // Lost the race against a concurrently delivered webhook
            Err(e) if e.is_conflict() => {}
            Err(e) => {
                warn!(
                    charge_id = charge.charge_id,
                    error = %e,
                    "Watcher finalization failed"
                );
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Worker for PaymentWatcher {
    fn name(&self) -> &'static str {
        "payment_watcher"
    }

    async fn tick(&self) -> AppResult<()> {
        let db = &self.resources.database;

        let expired = db.expire_stale_charges().await?;
        if expired > 0 {
            info!(count = expired, "Abandoned unpaid charges past their TTL");
        }

        let charges = db
            .list_charges_awaiting_confirmation(self.resources.config.workers.batch_size)
            .await?;

        for charge in &charges {
            self.poll_one(charge).await?;
        }

        Ok(())
    }
}
