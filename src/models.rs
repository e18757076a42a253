// ABOUTME: Core data models for entitlements, charges, and lifecycle outcomes
// ABOUTME: Mirrors the relational schema and the typed outcomes of finalize/activation
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of an entitlement row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No entitlement (initial state)
    None,
    /// Charge finalized, gateway call not yet confirmed
    ProvisioningPending,
    /// Credential provisioned at the gateway and valid
    Active,
    /// Past `valid_until`; credential revoked (or revocation logged as skipped)
    Expired,
    /// Provisioning confirmed permanently disabled by operator config
    Failed,
}

impl LifecycleState {
    /// Database representation of the state
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ProvisioningPending => "provisioning_pending",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }
}

/// One owner's right to use the VPN for a bounded time window
///
/// One row per owner. `credential_id` is non-null for `active` rows and may
/// be briefly non-null for `provisioning_pending` rows mid-activation.
#[derive(Debug, Clone, FromRow)]
pub struct Entitlement {
    /// Owner this entitlement belongs to (unique)
    pub owner_id: String,
    /// Opaque credential identifier generated locally and registered at the gateway
    pub credential_id: Option<String>,
    /// Gateway-issued connection payload
    pub secret_material: Option<String>,
    /// End of the paid window (UTC)
    pub valid_until: DateTime<Utc>,
    /// Current lifecycle state
    pub lifecycle_state: LifecycleState,
    /// Failed provisioning attempts since the row last became pending;
    /// observability only, reset when a new charge re-enters the pending state
    pub provisioning_attempts: i32,
    /// Most recent provisioning failure, for operators
    pub last_provisioning_error: Option<String>,
    /// Last renewal timestamp; idempotency guard for the renewal worker
    pub last_renewed_at: Option<DateTime<Utc>>,
}

/// Read-only entitlement status exposed to chat-layer collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementStatus {
    /// Current lifecycle state
    pub lifecycle_state: LifecycleState,
    /// End of the paid window, when one exists
    pub valid_until: Option<DateTime<Utc>>,
}

/// Status of a purchase attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    /// Awaiting payment confirmation
    Pending,
    /// Finalized exactly once
    Paid,
    /// Abandoned before payment
    Expired,
}

/// One purchase attempt, keyed by a caller-supplied idempotency key
#[derive(Debug, Clone, FromRow)]
pub struct PendingCharge {
    /// Caller-supplied idempotency key (unique)
    pub charge_id: String,
    /// Purchasing owner
    pub owner_id: String,
    /// Price in minor currency units
    pub amount: i64,
    /// Entitlement length this charge buys, in days
    pub duration_days: i32,
    /// Provider-side invoice id, set once one exists
    pub provider_reference: Option<String>,
    /// Current status
    pub status: ChargeStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// When the unpaid charge is abandoned
    pub expires_at: DateTime<Utc>,
}

/// Immutable receipt proving a charge was finalized exactly once
#[derive(Debug, Clone, FromRow)]
pub struct ChargeRecord {
    /// Finalized charge (unique)
    pub charge_id: String,
    /// Charged owner
    pub owner_id: String,
    /// Amount in minor currency units
    pub amount: i64,
    /// Provider-side payment reference; unique when present, rejects replays
    pub provider_payment_reference: Option<String>,
    /// Finalization time
    pub created_at: DateTime<Utc>,
}

/// Typed outcome of `finalize`, replacing exceptions-as-control-flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeOutcome {
    /// Active entitlement extended; the gateway was never touched
    Renewed,
    /// New entitlement provisioned synchronously after commit
    NewlyProvisioned,
    /// New entitlement committed as pending; the activation worker completes it
    ProvisioningDeferred,
}

/// Typed outcome of one activation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// This worker provisioned and activated the entitlement
    Activated,
    /// Another process activated the row first; treated as success
    AlreadyActivated,
    /// Transient gateway failure; the row stays pending for the next cycle
    Deferred,
    /// Provisioning confirmed disabled; the row is terminally failed
    FailedPermanently,
}
