// ABOUTME: Entitlement row operations: locked lookups, lock-skip claims, conditional transitions
// ABOUTME: The database row lock is the sole synchronization primitive across process instances
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgConnection;

use crate::database::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{Entitlement, EntitlementStatus, LifecycleState};

const ENTITLEMENT_COLUMNS: &str = "owner_id, credential_id, secret_material, valid_until, \
                                   lifecycle_state, provisioning_attempts, \
                                   last_provisioning_error, last_renewed_at";

// Qualified variant for UPDATE ... FROM claims, where the claim CTE also
// exposes owner_id and unqualified names would be ambiguous
const CLAIMED_COLUMNS: &str = "e.owner_id, e.credential_id, e.secret_material, e.valid_until, \
                               e.lifecycle_state, e.provisioning_attempts, \
                               e.last_provisioning_error, e.last_renewed_at";

fn lease_deadline(lease: Duration) -> AppResult<DateTime<Utc>> {
    let lease = ChronoDuration::from_std(lease)
        .map_err(|e| AppError::internal(format!("Claim lease out of range: {e}")))?;
    Ok(Utc::now() + lease)
}

impl Database {
    /// Fetch an entitlement without locking
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn get_entitlement(&self, owner_id: &str) -> AppResult<Option<Entitlement>> {
        let entitlement = sqlx::query_as::<_, Entitlement>(&format!(
            "SELECT {ENTITLEMENT_COLUMNS} FROM entitlements WHERE owner_id = $1"
        ))
        .bind(owner_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Database query failed: {e}")))?;

        Ok(entitlement)
    }

    /// Read-only status for chat-layer collaborators; no locking
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn get_entitlement_status(&self, owner_id: &str) -> AppResult<EntitlementStatus> {
        let entitlement = self.get_entitlement(owner_id).await?;

        Ok(entitlement.map_or(
            EntitlementStatus {
                lifecycle_state: LifecycleState::None,
                valid_until: None,
            },
            |e| EntitlementStatus {
                lifecycle_state: e.lifecycle_state,
                valid_until: Some(e.valid_until),
            },
        ))
    }

    /// Claim a batch of provisioning-pending entitlements for activation
    ///
    /// `FOR UPDATE SKIP LOCKED` keeps concurrent claimers off the same rows
    /// while the claim transaction runs; the short `claimed_until` lease
    /// keeps them off rows whose gateway call is still in flight after it
    /// commits. Completion paths clear the lease.
    ///
    /// # Errors
    ///
    /// Returns a database error if the claim fails.
    pub async fn claim_provisioning_batch(
        &self,
        limit: i64,
        lease: Duration,
    ) -> AppResult<Vec<Entitlement>> {
        let claimed_until = lease_deadline(lease)?;

        let rows = sqlx::query_as::<_, Entitlement>(&format!(
            r"
            WITH claimable AS (
                SELECT owner_id
                FROM entitlements
                WHERE lifecycle_state = 'provisioning_pending'
                  AND (claimed_until IS NULL OR claimed_until < now())
                ORDER BY updated_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE entitlements e
            SET claimed_until = $2
            FROM claimable c
            WHERE e.owner_id = c.owner_id
            RETURNING {CLAIMED_COLUMNS}
            "
        ))
        .bind(limit)
        .bind(claimed_until)
        .fetch_all(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to claim pending entitlements: {e}")))?;

        Ok(rows)
    }

    /// Claim one owner's pending entitlement for an immediate post-commit
    /// provisioning attempt
    ///
    /// Uses the same lease discipline as the batch claim, so the finalizer
    /// and a concurrently running activation worker can never both carry the
    /// same row to the gateway.
    ///
    /// # Errors
    ///
    /// Returns a database error if the claim fails.
    pub async fn claim_owner_for_provisioning(
        &self,
        owner_id: &str,
        lease: Duration,
    ) -> AppResult<Option<Entitlement>> {
        let claimed_until = lease_deadline(lease)?;

        let row = sqlx::query_as::<_, Entitlement>(&format!(
            r"
            WITH claimable AS (
                SELECT owner_id
                FROM entitlements
                WHERE owner_id = $1
                  AND lifecycle_state = 'provisioning_pending'
                  AND (claimed_until IS NULL OR claimed_until < now())
                FOR UPDATE SKIP LOCKED
            )
            UPDATE entitlements e
            SET claimed_until = $2
            FROM claimable c
            WHERE e.owner_id = c.owner_id
            RETURNING {CLAIMED_COLUMNS}
            "
        ))
        .bind(owner_id)
        .bind(claimed_until)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to claim entitlement: {e}")))?;

        Ok(row)
    }

    /// Conditionally activate a claimed entitlement after a successful
    /// gateway call
    ///
    /// Returns `false` when zero rows were affected, meaning another process
    /// already moved the row out of `provisioning_pending`; callers treat
    /// that as success and suppress duplicate side effects.
    ///
    /// # Errors
    ///
    /// Returns a database error if the update fails.
    pub async fn complete_activation(
        &self,
        owner_id: &str,
        credential_id: &str,
        secret_material: &str,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r"
            UPDATE entitlements
            SET credential_id = $2,
                secret_material = $3,
                lifecycle_state = 'active',
                last_provisioning_error = NULL,
                claimed_until = NULL,
                updated_at = now()
            WHERE owner_id = $1 AND lifecycle_state = 'provisioning_pending'
            ",
        )
        .bind(owner_id)
        .bind(credential_id)
        .bind(secret_material)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to activate entitlement: {e}")))?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a transient provisioning failure and release the claim lease
    ///
    /// The row stays `provisioning_pending` and is retried next cycle;
    /// attempt counts are bookkeeping, never a permanence signal.
    ///
    /// # Errors
    ///
    /// Returns a database error if the update fails.
    pub async fn record_provisioning_failure(&self, owner_id: &str, error: &str) -> AppResult<()> {
        sqlx::query(
            r"
            UPDATE entitlements
            SET provisioning_attempts = provisioning_attempts + 1,
                last_provisioning_error = $2,
                claimed_until = NULL,
                updated_at = now()
            WHERE owner_id = $1 AND lifecycle_state = 'provisioning_pending'
            ",
        )
        .bind(owner_id)
        .bind(error)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to record provisioning failure: {e}")))?;

        Ok(())
    }

    /// Terminally fail a pending entitlement after confirmed-permanent
    /// gateway disablement
    ///
    /// # Errors
    ///
    /// Returns a database error if the update fails.
    pub async fn mark_provisioning_failed(&self, owner_id: &str, error: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r"
            UPDATE entitlements
            SET lifecycle_state = 'failed',
                last_provisioning_error = $2,
                claimed_until = NULL,
                updated_at = now()
            WHERE owner_id = $1 AND lifecycle_state = 'provisioning_pending'
            ",
        )
        .bind(owner_id)
        .bind(error)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to mark entitlement failed: {e}")))?;

        Ok(result.rows_affected() == 1)
    }

    /// Claim a batch of active entitlements past `valid_until` for revocation
    ///
    /// # Errors
    ///
    /// Returns a database error if the claim fails.
    pub async fn claim_expired_batch(
        &self,
        limit: i64,
        lease: Duration,
    ) -> AppResult<Vec<Entitlement>> {
        let claimed_until = lease_deadline(lease)?;

        let rows = sqlx::query_as::<_, Entitlement>(&format!(
            r"
            WITH claimable AS (
                SELECT owner_id
                FROM entitlements
                WHERE lifecycle_state = 'active'
                  AND valid_until < now()
                  AND (claimed_until IS NULL OR claimed_until < now())
                ORDER BY valid_until
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE entitlements e
            SET claimed_until = $2
            FROM claimable c
            WHERE e.owner_id = c.owner_id
            RETURNING {CLAIMED_COLUMNS}
            "
        ))
        .bind(limit)
        .bind(claimed_until)
        .fetch_all(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to claim expired entitlements: {e}")))?;

        Ok(rows)
    }

    /// Conditionally expire an entitlement after remote revocation
    ///
    /// Guarded on the exact credential this worker revoked, so a row that
    /// was re-issued in the meantime is left alone.
    ///
    /// # Errors
    ///
    /// Returns a database error if the update fails.
    pub async fn complete_expiry(
        &self,
        owner_id: &str,
        expected_credential_id: &str,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r"
            UPDATE entitlements
            SET lifecycle_state = 'expired',
                credential_id = NULL,
                secret_material = NULL,
                claimed_until = NULL,
                updated_at = now()
            WHERE owner_id = $1
              AND lifecycle_state = 'active'
              AND credential_id = $2
            ",
        )
        .bind(owner_id)
        .bind(expected_credential_id)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to expire entitlement: {e}")))?;

        Ok(result.rows_affected() == 1)
    }

    /// Release a claim lease without changing state (transient skip)
    ///
    /// # Errors
    ///
    /// Returns a database error if the update fails.
    pub async fn release_claim(&self, owner_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE entitlements SET claimed_until = NULL WHERE owner_id = $1")
            .bind(owner_id)
            .execute(self.pool())
            .await
            .map_err(|e| AppError::database(format!("Failed to release claim: {e}")))?;

        Ok(())
    }

    /// Claim active entitlements expiring within the lookahead window whose
    /// owner balance covers one renewal period
    ///
    /// `last_renewed_at` doubles as an idempotency guard: rows renewed
    /// within the lookahead window are not candidates again, defending
    /// against clock skew between lock acquisition and commit.
    ///
    /// # Errors
    ///
    /// Returns a database error if the claim fails.
    pub async fn claim_renewal_batch(
        &self,
        limit: i64,
        lookahead: Duration,
        renewal_price: i64,
        lease: Duration,
    ) -> AppResult<Vec<Entitlement>> {
        let claimed_until = lease_deadline(lease)?;
        let lookahead = ChronoDuration::from_std(lookahead)
            .map_err(|e| AppError::internal(format!("Renewal lookahead out of range: {e}")))?;
        let now = Utc::now();
        let window_end = now + lookahead;
        let renewed_guard = now - lookahead;

        let rows = sqlx::query_as::<_, Entitlement>(&format!(
            r"
            WITH claimable AS (
                SELECT e.owner_id
                FROM entitlements e
                JOIN balances b ON b.owner_id = e.owner_id
                WHERE e.lifecycle_state = 'active'
                  AND e.valid_until > now()
                  AND e.valid_until < $2
                  AND b.amount >= $3
                  AND (e.last_renewed_at IS NULL OR e.last_renewed_at < $4)
                  AND (e.claimed_until IS NULL OR e.claimed_until < now())
                ORDER BY e.valid_until
                LIMIT $1
                FOR UPDATE OF e SKIP LOCKED
            )
            UPDATE entitlements e
            SET claimed_until = $5
            FROM claimable c
            WHERE e.owner_id = c.owner_id
            RETURNING {CLAIMED_COLUMNS}
            "
        ))
        .bind(limit)
        .bind(window_end)
        .bind(renewal_price)
        .bind(renewed_guard)
        .bind(claimed_until)
        .fetch_all(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to claim renewal candidates: {e}")))?;

        Ok(rows)
    }

    /// Debit the owner's balance and extend `valid_until` in one transaction
    ///
    /// Never touches `credential_id`. Returns `false` without side effects
    /// when the balance no longer covers the price or the row is no longer
    /// active.
    ///
    /// # Errors
    ///
    /// Returns a database error if the transaction fails.
    pub async fn apply_renewal(
        &self,
        owner_id: &str,
        renewal_price: i64,
        renewal_period_days: i32,
    ) -> AppResult<bool> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| AppError::database(format!("Failed to begin transaction: {e}")))?;

        let debited = sqlx::query(
            r"
            UPDATE balances
            SET amount = amount - $2, updated_at = now()
            WHERE owner_id = $1 AND amount >= $2
            ",
        )
        .bind(owner_id)
        .bind(renewal_price)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::database(format!("Failed to debit balance: {e}")))?;

        if debited.rows_affected() == 0 {
            tx.rollback().await.ok();
            self.release_claim(owner_id).await?;
            return Ok(false);
        }

        let extended = sqlx::query(
            r"
            UPDATE entitlements
            SET valid_until = valid_until + make_interval(days => $2),
                last_renewed_at = now(),
                claimed_until = NULL,
                updated_at = now()
            WHERE owner_id = $1
              AND lifecycle_state = 'active'
              AND credential_id IS NOT NULL
            ",
        )
        .bind(owner_id)
        .bind(renewal_period_days)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::database(format!("Failed to extend entitlement: {e}")))?;

        if extended.rows_affected() == 0 {
            tx.rollback().await.ok();
            self.release_claim(owner_id).await?;
            return Ok(false);
        }

        tx.commit()
            .await
            .map_err(|e| AppError::database(format!("Failed to commit renewal: {e}")))?;

        Ok(true)
    }
}

/// Lock the owner's entitlement row inside the finalizer's transaction
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn lock_entitlement(
    conn: &mut PgConnection,
    owner_id: &str,
) -> AppResult<Option<Entitlement>> {
    let entitlement = sqlx::query_as::<_, Entitlement>(&format!(
        "SELECT {ENTITLEMENT_COLUMNS} FROM entitlements WHERE owner_id = $1 FOR UPDATE"
    ))
    .bind(owner_id)
    .fetch_optional(conn)
    .await
    .map_err(|e| AppError::database(format!("Failed to lock entitlement: {e}")))?;

    Ok(entitlement)
}

/// Extend an active entitlement inside the finalizer's transaction (renewal
/// path); the credential is never touched
///
/// # Errors
///
/// Returns `InvariantViolation` if the locked row stopped satisfying the
/// renewal preconditions, which must never happen under the row lock.
pub async fn extend_active_entitlement(
    conn: &mut PgConnection,
    owner_id: &str,
    duration_days: i32,
) -> AppResult<DateTime<Utc>> {
    let row = sqlx::query_as::<_, (DateTime<Utc>,)>(
        r"
        UPDATE entitlements
        SET valid_until = valid_until + make_interval(days => $2),
            updated_at = now()
        WHERE owner_id = $1
          AND lifecycle_state = 'active'
          AND credential_id IS NOT NULL
        RETURNING valid_until
        ",
    )
    .bind(owner_id)
    .bind(duration_days)
    .fetch_optional(conn)
    .await
    .map_err(|e| AppError::database(format!("Failed to extend entitlement: {e}")))?;

    row.map(|(valid_until,)| valid_until).ok_or_else(|| {
        AppError::invariant(format!(
            "Renewal path lost its locked active row for owner {owner_id}"
        ))
    })
}

/// Upsert the owner's entitlement into `provisioning_pending` inside the
/// finalizer's transaction (new-issuance path)
///
/// Clears any stale credential fields; the gateway is never called here.
///
/// # Errors
///
/// Returns a database error if the upsert fails.
pub async fn mark_provisioning_pending(
    conn: &mut PgConnection,
    owner_id: &str,
    valid_until: DateTime<Utc>,
) -> AppResult<()> {
    sqlx::query(
        r"
        INSERT INTO entitlements (owner_id, valid_until, lifecycle_state)
        VALUES ($1, $2, 'provisioning_pending')
        ON CONFLICT (owner_id) DO UPDATE SET
            lifecycle_state = 'provisioning_pending',
            credential_id = NULL,
            secret_material = NULL,
            valid_until = EXCLUDED.valid_until,
            provisioning_attempts = 0,
            last_provisioning_error = NULL,
            claimed_until = NULL,
            updated_at = now()
        ",
    )
    .bind(owner_id)
    .bind(valid_until)
    .execute(conn)
    .await
    .map_err(|e| AppError::database(format!("Failed to mark entitlement pending: {e}")))?;

    Ok(())
}
