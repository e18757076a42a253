// ABOUTME: Database operations for pending charges, immutable receipts, and balances
// ABOUTME: Conditional status flips are the idempotency backbone of charge finalization
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::{PgConnection, Row};

use crate::database::{map_insert_error, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{ChargeRecord, PendingCharge};

const CHARGE_COLUMNS: &str = "charge_id, owner_id, amount, duration_days, provider_reference, \
                              status, created_at, expires_at";

impl Database {
    /// Create a pending charge under a caller-supplied idempotency key
    ///
    /// Must be called before any provider interaction so the key exists when
    /// confirmation arrives.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the charge id is already taken, or a database
    /// error.
    pub async fn create_pending_charge(
        &self,
        charge_id: &str,
        owner_id: &str,
        amount: i64,
        duration_days: i32,
        ttl: std::time::Duration,
    ) -> AppResult<()> {
        if amount <= 0 {
            return Err(AppError::invalid_input("Charge amount must be positive"));
        }
        if duration_days <= 0 {
            return Err(AppError::invalid_input("Charge duration must be positive"));
        }

        let expires_at = Utc::now()
            + ChronoDuration::from_std(ttl)
                .map_err(|e| AppError::invalid_input(format!("Charge TTL out of range: {e}")))?;

        sqlx::query(
            r"
            INSERT INTO pending_charges (charge_id, owner_id, amount, duration_days, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(charge_id)
        .bind(owner_id)
        .bind(amount)
        .bind(duration_days)
        .bind(expires_at)
        .execute(self.pool())
        .await
        .map_err(|e| map_insert_error(e, "Charge id already exists"))?;

        Ok(())
    }

    /// Record the provider-side invoice id once one exists
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the charge does not exist or is no longer pending.
    pub async fn set_provider_reference(
        &self,
        charge_id: &str,
        provider_reference: &str,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r"
            UPDATE pending_charges
            SET provider_reference = $2
            WHERE charge_id = $1 AND status = 'pending'
            ",
        )
        .bind(charge_id)
        .bind(provider_reference)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to set provider reference: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("Pending charge"));
        }
        Ok(())
    }

    /// Fetch a charge by id
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn get_pending_charge(&self, charge_id: &str) -> AppResult<Option<PendingCharge>> {
        let charge = sqlx::query_as::<_, PendingCharge>(&format!(
            "SELECT {CHARGE_COLUMNS} FROM pending_charges WHERE charge_id = $1"
        ))
        .bind(charge_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Database query failed: {e}")))?;

        Ok(charge)
    }

    /// List pending charges the payment watcher should poll the provider for
    ///
    /// Only charges that already have a provider-side invoice and have not
    /// passed their TTL are returned.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn list_charges_awaiting_confirmation(
        &self,
        limit: i64,
    ) -> AppResult<Vec<PendingCharge>> {
        let charges = sqlx::query_as::<_, PendingCharge>(&format!(
            r"
            SELECT {CHARGE_COLUMNS}
            FROM pending_charges
            WHERE status = 'pending'
              AND provider_reference IS NOT NULL
              AND expires_at > now()
            ORDER BY created_at
            LIMIT $1
            "
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Database query failed: {e}")))?;

        Ok(charges)
    }

    /// Abandon unpaid charges past their TTL; returns the number expired
    ///
    /// # Errors
    ///
    /// Returns a database error if the update fails.
    pub async fn expire_stale_charges(&self) -> AppResult<u64> {
        let result = sqlx::query(
            r"
            UPDATE pending_charges
            SET status = 'expired'
            WHERE status = 'pending' AND expires_at <= now()
            ",
        )
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to expire stale charges: {e}")))?;

        Ok(result.rows_affected())
    }

    /// Fetch the immutable receipt for a charge, if finalization happened
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn get_charge_record(&self, charge_id: &str) -> AppResult<Option<ChargeRecord>> {
        let record = sqlx::query_as::<_, ChargeRecord>(
            r"
            SELECT charge_id, owner_id, amount, provider_payment_reference, created_at
            FROM charge_records
            WHERE charge_id = $1
            ",
        )
        .bind(charge_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Database query failed: {e}")))?;

        Ok(record)
    }

    /// Add prepaid funds to an owner's balance
    ///
    /// # Errors
    ///
    /// Returns a database error if the upsert fails.
    pub async fn credit_balance(&self, owner_id: &str, amount: i64) -> AppResult<()> {
        if amount <= 0 {
            return Err(AppError::invalid_input("Credit amount must be positive"));
        }

        sqlx::query(
            r"
            INSERT INTO balances (owner_id, amount, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (owner_id) DO UPDATE SET
                amount = balances.amount + EXCLUDED.amount,
                updated_at = now()
            ",
        )
        .bind(owner_id)
        .bind(amount)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to credit balance: {e}")))?;

        Ok(())
    }

    /// Current prepaid balance for an owner (zero when no row exists)
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn get_balance(&self, owner_id: &str) -> AppResult<i64> {
        let row = sqlx::query("SELECT amount FROM balances WHERE owner_id = $1")
            .bind(owner_id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| AppError::database(format!("Database query failed: {e}")))?;

        Ok(row.map_or(0, |r| r.get::<i64, _>("amount")))
    }
}

/// Conditionally flip a charge `pending -> paid` inside the finalizer's
/// transaction
///
/// Exactly one caller ever sees the row returned; every other caller
/// observes `None` and must not re-apply side effects.
///
/// # Errors
///
/// Returns a database error if the update fails.
pub async fn mark_charge_paid(
    conn: &mut PgConnection,
    charge_id: &str,
) -> AppResult<Option<PendingCharge>> {
    let charge = sqlx::query_as::<_, PendingCharge>(&format!(
        r"
        UPDATE pending_charges
        SET status = 'paid'
        WHERE charge_id = $1 AND status = 'pending'
        RETURNING {CHARGE_COLUMNS}
        "
    ))
    .bind(charge_id)
    .fetch_optional(conn)
    .await
    .map_err(|e| AppError::database(format!("Failed to mark charge paid: {e}")))?;

    Ok(charge)
}

/// Insert the immutable receipt inside the finalizer's transaction
///
/// The unique constraint on `provider_payment_reference` rejects
/// provider-side replays with a different charge id.
///
/// # Errors
///
/// Returns `Conflict` on a duplicate payment reference, or a database error.
pub async fn insert_charge_record(
    conn: &mut PgConnection,
    charge: &PendingCharge,
    provider_payment_reference: Option<&str>,
) -> AppResult<()> {
    sqlx::query(
        r"
        INSERT INTO charge_records (charge_id, owner_id, amount, provider_payment_reference)
        VALUES ($1, $2, $3, $4)
        ",
    )
    .bind(&charge.charge_id)
    .bind(&charge.owner_id)
    .bind(charge.amount)
    .bind(provider_payment_reference)
    .execute(conn)
    .await
    .map_err(|e| map_insert_error(e, "Payment reference already recorded"))?;

    Ok(())
}
