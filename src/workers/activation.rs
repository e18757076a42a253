// ABOUTME: Activation worker provisioning pending entitlements at the VPN gateway
// ABOUTME: Gateway calls happen outside transactions; conditional updates absorb races
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::ServerResources;
use crate::errors::AppResult;
use crate::gateway::GATEWAY_DEPENDENCY;
use crate::models::{ActivationOutcome, Entitlement};
use crate::workers::Worker;

/// Provisions claimed `provisioning_pending` rows at the gateway
pub struct ActivationWorker {
    resources: ServerResources,
}

impl ActivationWorker {
    /// Create the activation worker
    #[must_use]
    pub const fn new(resources: ServerResources) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl Worker for ActivationWorker {
    fn name(&self) -> &'static str {
        "activation"
    }

    async fn tick(&self) -> AppResult<()> {
        let workers_config = &self.resources.config.workers;
        let claimed = self
            .resources
            .database
            .claim_provisioning_batch(workers_config.batch_size, workers_config.iteration_timeout)
            .await?;

        for entitlement in &claimed {
            // Contain per-row failures so one bad row cannot starve the
            // rest of the batch
            if let Err(e) = provision_entitlement(&self.resources, entitlement).await {
                error!(
                    owner_id = entitlement.owner_id,
                    error = %e,
                    "Provisioning attempt errored"
                );
            }
        }

        Ok(())
    }
}

/// Provision one claimed entitlement at the gateway
///
/// Shared between the worker batch and the finalizer's post-commit
/// immediate attempt; both hold a claim lease on the row when calling this.
/// The credential identifier is generated locally before the gateway call
/// so the non-idempotent `add-user` request is never repeated with a reused
/// identifier.
///
/// # Errors
///
/// Returns a database error if a state transition cannot be recorded; all
/// gateway failures are absorbed into the returned outcome.
pub async fn provision_entitlement(
    resources: &ServerResources,
    entitlement: &Entitlement,
) -> AppResult<ActivationOutcome> {
    let db = &resources.database;
    let owner_id = &entitlement.owner_id;

    // The only path to a terminal failure is the operator explicitly
    // disabling provisioning; outages of any length stay retryable
    if !resources.config.gateway.provisioning_enabled {
        let message = "Provisioning disabled by operator configuration";
        if db.mark_provisioning_failed(owner_id, message).await? {
            warn!(owner_id, "Entitlement failed: provisioning is disabled");
            return Ok(ActivationOutcome::FailedPermanently);
        }
        return Ok(ActivationOutcome::AlreadyActivated);
    }

    let breaker = resources.breakers.get(GATEWAY_DEPENDENCY);
    if !breaker.allow_request() {
        db.release_claim(owner_id).await?;
        return Ok(ActivationOutcome::Deferred);
    }

    let credential_id = Uuid::new_v4().to_string();
    let provisioned = match resources
        .gateway
        .add_credential(owner_id, &credential_id, entitlement.valid_until)
        .await
    {
        Ok(provisioned) => {
            breaker.record_success();
            provisioned
        }
        Err(e) => {
            if e.is_transient() {
                breaker.record_failure();
            }
            warn!(owner_id, error = %e, "Gateway provisioning attempt failed");
            db.record_provisioning_failure(owner_id, &e.to_string())
                .await?;

            // The ceiling is an operator signal only; the row keeps
            // retrying for as long as provisioning stays enabled
            let attempts = entitlement.provisioning_attempts + 1;
            let ceiling = resources.config.workers.max_provisioning_attempts;
            if attempts >= ceiling {
                warn!(
                    owner_id,
                    attempts,
                    ceiling,
                    "Provisioning attempts crossed the alert ceiling, still retrying"
                );
            }
            return Ok(ActivationOutcome::Deferred);
        }
    };

    let activated = db
        .complete_activation(
            owner_id,
            &provisioned.credential_id,
            &provisioned.secret_material,
        )
        .await?;

    if !activated {
        // Another process moved the row out of provisioning_pending while
        // our gateway call was in flight. Our freshly added credential is
        // now an orphan at the gateway; remove it best-effort and suppress
        // the duplicate owner notification.
        info!(
            owner_id,
            credential_id = provisioned.credential_id,
            "Row already activated elsewhere, removing orphan credential"
        );
        if let Err(e) = resources
            .gateway
            .remove_credential(&provisioned.credential_id)
            .await
        {
            warn!(
                owner_id,
                credential_id = provisioned.credential_id,
                error = %e,
                "Orphan credential removal failed, left for reconciliation"
            );
        }
        return Ok(ActivationOutcome::AlreadyActivated);
    }

    // Re-read before the externally visible notification so a concurrent
    // transition between our update and this log cannot misreport state
    let delivered = db
        .get_entitlement(owner_id)
        .await?
        .is_some_and(|e| e.credential_id.as_deref() == Some(provisioned.credential_id.as_str()));
    if delivered {
        info!(
            owner_id,
            credential_id = provisioned.credential_id,
            valid_until = %entitlement.valid_until,
            "Entitlement activated, owner notified with connection details"
        );
    }

    Ok(ActivationOutcome::Activated)
}
