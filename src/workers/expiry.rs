// ABOUTME: Expiry worker revoking gateway credentials for entitlements past valid_until
// ABOUTME: Remote revocation always precedes the local state flip, never inside a transaction
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::context::ServerResources;
use crate::errors::AppResult;
use crate::gateway::GATEWAY_DEPENDENCY;
use crate::models::Entitlement;
use crate::workers::Worker;

/// Revokes credentials for active entitlements whose validity has lapsed
pub struct ExpiryWorker {
    resources: ServerResources,
}

impl ExpiryWorker {
    /// Create the expiry worker
    #[must_use]
    pub const fn new(resources: ServerResources) -> Self {
        Self { resources }
    }

    async fn expire_one(&self, entitlement: &Entitlement) -> AppResult<()> {
        let db = &self.resources.database;
        let owner_id = &entitlement.owner_id;

        let Some(credential_id) = entitlement.credential_id.as_deref() else {
            // Unreachable under the schema check constraint; release and move on
            warn!(owner_id, "Claimed active row has no credential, releasing");
            return db.release_claim(owner_id).await;
        };

        // With the gateway administratively disabled the remote credential
        // cannot be revoked; expire locally anyway so access accounting stays
        // correct, and leave the remote side for manual reconciliation
        if !self.resources.config.gateway.provisioning_enabled {
            warn!(
                owner_id,
                credential_id,
                "Gateway disabled, expiring locally and leaving remote credential behind"
            );
            db.complete_expiry(owner_id, credential_id).await?;
            return Ok(());
        }

        let breaker = self.resources.breakers.get(GATEWAY_DEPENDENCY);
        if !breaker.allow_request() {
            return db.release_claim(owner_id).await;
        }

        // Revoke remotely first; the local flip only happens once the
        // credential is confirmed gone (removal is idempotent at the gateway)
        match self.resources.gateway.remove_credential(credential_id).await {
            Ok(()) => breaker.record_success(),
            Err(e) => {
                if e.is_transient() {
                    breaker.record_failure();
                }
                warn!(
                    owner_id,
                    credential_id,
                    error = %e,
                    "Credential revocation failed, retrying next cycle"
                );
                return db.release_claim(owner_id).await;
            }
        }

        if db.complete_expiry(owner_id, credential_id).await? {
            info!(owner_id, credential_id, "Entitlement expired and revoked");
        } else {
            // The row was re-issued with a different credential while our
            // revocation was in flight; the new credential stays untouched
            info!(
                owner_id,
                credential_id, "Row changed during revocation, leaving it alone"
            );
            db.release_claim(owner_id).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Worker for ExpiryWorker {
    fn name(&self) -> &'static str {
        "expiry"
    }

    async fn tick(&self) -> AppResult<()> {
        let workers_config = &self.resources.config.workers;
        let claimed = self
            .resources
            .database
            .claim_expired_batch(workers_config.batch_size, workers_config.iteration_timeout)
            .await?;

        for entitlement in &claimed {
            if let Err(e) = self.expire_one(entitlement).await {
                error!(
                    owner_id = entitlement.owner_id,
                    error = %e,
                    "Expiry attempt errored"
                );
            }
        }

        Ok(())
    }
}
