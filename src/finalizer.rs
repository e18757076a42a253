// ABOUTME: Transactional charge finalizer turning confirmed payments into entitlements exactly once
// ABOUTME: Renews active entitlements or defers new provisioning to the activation worker
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::ServerResources;
use crate::database::charges::{insert_charge_record, mark_charge_paid};
use crate::database::entitlements::{
    extend_active_entitlement, lock_entitlement, mark_provisioning_pending,
};
use crate::errors::{AppError, AppResult};
use crate::models::{
    ActivationOutcome, ChargeStatus, EntitlementStatus, FinalizeOutcome, LifecycleState,
    PendingCharge,
};
use crate::workers::activation::provision_entitlement;

/// Tolerance for provider-reported amounts, in minor currency units.
/// Covers provider-side rounding; anything larger is a mismatch.
const AMOUNT_TOLERANCE: i64 = 1;

/// Charge finalization service
///
/// `finalize` is the convergence point of the webhook and watcher
/// confirmation paths; both may race safely because the `pending -> paid`
/// flip admits exactly one winner.
#[derive(Clone)]
pub struct ChargeFinalizer {
    resources: ServerResources,
}

impl ChargeFinalizer {
    /// Create a finalizer over the shared server resources
    #[must_use]
    pub const fn new(resources: ServerResources) -> Self {
        Self { resources }
    }

    /// Create a pending charge for a purchase attempt
    ///
    /// Produces the unique `charge_id` idempotency key before any provider
    /// interaction.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid input or database failure.
    pub async fn create_pending_charge(
        &self,
        owner_id: &str,
        amount: i64,
        duration_days: i32,
    ) -> AppResult<String> {
        let charge_id = Uuid::new_v4().to_string();
        self.resources
            .database
            .create_pending_charge(
                &charge_id,
                owner_id,
                amount,
                duration_days,
                self.resources.config.payments.charge_ttl,
            )
            .await?;

        info!(charge_id, owner_id, amount, "Created pending charge");
        Ok(charge_id)
    }

    /// Read-only entitlement status for collaborators
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn get_entitlement_status(&self, owner_id: &str) -> AppResult<EntitlementStatus> {
        self.resources.database.get_entitlement_status(owner_id).await
    }

    /// Finalize a confirmed payment
    ///
    /// One database transaction conditionally flips the charge to `paid`,
    /// writes the immutable receipt, and either extends an active
    /// entitlement (renewal) or marks it provisioning-pending (issuance).
    /// The gateway is never called inside the transaction; a failed
    /// issuance-side gateway call after commit merely leaves the row for
    /// the activation worker.
    ///
    /// # Errors
    ///
    /// - `NotFound` when no charge exists under `charge_id`
    /// - `InvalidInput` on an amount mismatch (charge left untouched)
    /// - `Conflict` when the charge was already finalized (idempotent no-op)
    /// - Database errors roll the whole transaction back, reverting the
    ///   charge to `pending` for a safe retry
    pub async fn finalize(
        &self,
        charge_id: &str,
        provider_amount: i64,
        provider_payment_reference: Option<&str>,
    ) -> AppResult<FinalizeOutcome> {
        let db = &self.resources.database;

        // Validate preconditions before mutating anything
        let charge = db
            .get_pending_charge(charge_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Charge {charge_id}")))?;

        if (provider_amount - charge.amount).abs() > AMOUNT_TOLERANCE {
            return Err(AppError::invalid_input(format!(
                "Amount mismatch for charge {charge_id}: expected {}, provider reported {provider_amount}",
                charge.amount
            )));
        }

        if charge.status != ChargeStatus::Pending {
            return Err(AppError::conflict(format!(
                "Charge {charge_id} already finalized"
            )));
        }

        let mut tx = db
            .pool()
            .begin()
            .await
            .map_err(|e| AppError::database(format!("Failed to begin transaction: {e}")))?;

        // Exactly one finalizer wins this conditional update; everyone else
        // observes zero rows and stops here with no side effects
        let Some(paid_charge) = mark_charge_paid(&mut tx, charge_id).await? else {
            return Err(AppError::conflict(format!(
                "Charge {charge_id} already finalized"
            )));
        };

        insert_charge_record(&mut tx, &paid_charge, provider_payment_reference).await?;

        let entitlement = lock_entitlement(&mut tx, &paid_charge.owner_id).await?;
        let renewal = entitlement.as_ref().is_some_and(|e| {
            e.lifecycle_state == LifecycleState::Active
                && e.valid_until > Utc::now()
                && e.credential_id.is_some()
        });

        let outcome = if renewal {
            let new_valid_until =
                extend_active_entitlement(&mut tx, &paid_charge.owner_id, paid_charge.duration_days)
                    .await?;
            info!(
                charge_id,
                owner_id = paid_charge.owner_id,
                %new_valid_until,
                "Charge finalized on the renewal path"
            );
            FinalizeOutcome::Renewed
        } else {
            let valid_until = Utc::now() + ChronoDuration::days(i64::from(paid_charge.duration_days));
            mark_provisioning_pending(&mut tx, &paid_charge.owner_id, valid_until).await?;
            info!(
                charge_id,
                owner_id = paid_charge.owner_id,
                "Charge finalized, provisioning enqueued"
            );
            FinalizeOutcome::ProvisioningDeferred
        };

        tx.commit()
            .await
            .map_err(|e| AppError::database(format!("Failed to commit finalization: {e}")))?;

        if outcome == FinalizeOutcome::ProvisioningDeferred {
            return Ok(self.attempt_immediate_provisioning(&paid_charge).await);
        }
        Ok(outcome)
    }

    /// Best-effort synchronous provisioning pass after the issuance commit
    ///
    /// Goes through the same claim/activate routine the activation worker
    /// uses; any failure simply leaves the row pending for the worker.
    async fn attempt_immediate_provisioning(&self, charge: &PendingCharge) -> FinalizeOutcome {
        let lease = self.resources.config.workers.iteration_timeout;

        let claimed = match self
            .resources
            .database
            .claim_owner_for_provisioning(&charge.owner_id, lease)
            .await
        {
            Ok(Some(entitlement)) => entitlement,
            Ok(None) => return FinalizeOutcome::ProvisioningDeferred,
            Err(e) => {
                warn!(
                    owner_id = charge.owner_id,
                    error = %e,
                    "Immediate provisioning claim failed, deferring to worker"
                );
                return FinalizeOutcome::ProvisioningDeferred;
            }
        };

        match provision_entitlement(&self.resources, &claimed).await {
            Ok(ActivationOutcome::Activated | ActivationOutcome::AlreadyActivated) => {
                FinalizeOutcome::NewlyProvisioned
            }
            Ok(ActivationOutcome::Deferred | ActivationOutcome::FailedPermanently) => {
                FinalizeOutcome::ProvisioningDeferred
            }
            Err(e) => {
                warn!(
                    owner_id = charge.owner_id,
                    error = %e,
                    "Immediate provisioning failed, deferring to worker"
                );
                FinalizeOutcome::ProvisioningDeferred
            }
        }
    }
}
