// ABOUTME: Integration tests for transactional charge finalization
// ABOUTME: Covers exactly-once semantics, amount validation, renewal vs issuance paths
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

use chrono::{Duration as ChronoDuration, Utc};
use tollgate::errors::AppError;
use tollgate::finalizer::ChargeFinalizer;
use tollgate::models::{ChargeStatus, FinalizeOutcome, LifecycleState};

mod common;

#[tokio::test]
async fn test_finalize_new_issuance_provisions_immediately() {
    common::init_test_logging();
    let isolated = match common::IsolatedPostgresDb::new().await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Skipping test: PostgreSQL not available: {e}");
            return;
        }
    };
    let db = isolated.database().await.expect("Failed to get database");
    let gateway = common::MockGateway::start().await;
    let provider = common::MockPaymentProvider::start().await;
    let resources = common::test_resources(db.clone(), &gateway.base_url, &provider.base_url).await;
    let finalizer = ChargeFinalizer::new(resources);

    let owner = common::random_owner();
    let charge_id = finalizer
        .create_pending_charge(&owner, 1000, 30)
        .await
        .expect("Failed to create charge");

    let outcome = finalizer
        .finalize(&charge_id, 1000, Some("pay_abc"))
        .await
        .expect("Finalize failed");
    assert_eq!(outcome, FinalizeOutcome::NewlyProvisioned);

    let entitlement = db
        .get_entitlement(&owner)
        .await
        .expect("Query failed")
        .expect("Entitlement missing");
    assert_eq!(entitlement.lifecycle_state, LifecycleState::Active);
    assert!(entitlement.credential_id.is_some());
    assert!(entitlement.secret_material.is_some());
    assert!(entitlement.valid_until > Utc::now() + ChronoDuration::days(29));
    assert_eq!(gateway.add_attempts(), 1);

    let record = db
        .get_charge_record(&charge_id)
        .await
        .expect("Query failed")
        .expect("Receipt missing");
    assert_eq!(record.owner_id, owner);
    assert_eq!(record.amount, 1000);
    assert_eq!(record.provider_payment_reference.as_deref(), Some("pay_abc"));
}

#[tokio::test]
async fn test_finalize_is_idempotent() {
    common::init_test_logging();
    let isolated = match common::IsolatedPostgresDb::new().await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Skipping test: PostgreSQL not available: {e}");
            return;
        }
    };
    let db = isolated.database().await.expect("Failed to get database");
    let gateway = common::MockGateway::start().await;
    let provider = common::MockPaymentProvider::start().await;
    let resources = common::test_resources(db.clone(), &gateway.base_url, &provider.base_url).await;
    let finalizer = ChargeFinalizer::new(resources);

    let owner = common::random_owner();
    let charge_id = finalizer
        .create_pending_charge(&owner, 1000, 30)
        .await
        .expect("Failed to create charge");

    finalizer
        .finalize(&charge_id, 1000, Some("pay_once"))
        .await
        .expect("First finalize failed");
    let first = db
        .get_entitlement(&owner)
        .await
        .expect("Query failed")
        .expect("Entitlement missing");

    // Redelivery of the same confirmation must change nothing
    let err = finalizer
        .finalize(&charge_id, 1000, Some("pay_once"))
        .await
        .expect_err("Second finalize should conflict");
    assert!(err.is_conflict(), "Expected conflict, got: {err}");

    let second = db
        .get_entitlement(&owner)
        .await
        .expect("Query failed")
        .expect("Entitlement missing");
    assert_eq!(first.credential_id, second.credential_id);
    assert_eq!(first.valid_until, second.valid_until);
    assert_eq!(gateway.add_attempts(), 1);
}

#[tokio::test]
async fn test_finalize_amount_mismatch_leaves_charge_pending() {
    common::init_test_logging();
    let isolated = match common::IsolatedPostgresDb::new().await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Skipping test: PostgreSQL not available: {e}");
            return;
        }
    };
    let db = isolated.database().await.expect("Failed to get database");
    let gateway = common::MockGateway::start().await;
    let provider = common::MockPaymentProvider::start().await;
    let resources = common::test_resources(db.clone(), &gateway.base_url, &provider.base_url).await;
    let finalizer = ChargeFinalizer::new(resources);

    let owner = common::random_owner();
    let charge_id = finalizer
        .create_pending_charge(&owner, 1000, 30)
        .await
        .expect("Failed to create charge");

    let err = finalizer
        .finalize(&charge_id, 500, Some("pay_short"))
        .await
        .expect_err("Mismatched amount should fail");
    assert!(matches!(err, AppError::InvalidInput(_)));

    // The charge survives untouched so a corrected confirmation can land
    let charge = db
        .get_pending_charge(&charge_id)
        .await
        .expect("Query failed")
        .expect("Charge missing");
    assert_eq!(charge.status, ChargeStatus::Pending);
    assert!(db.get_entitlement(&owner).await.expect("Query failed").is_none());
    assert_eq!(gateway.add_attempts(), 0);
}

#[tokio::test]
async fn test_finalize_accepts_amount_within_tolerance() {
    common::init_test_logging();
    let isolated = match common::IsolatedPostgresDb::new().await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Skipping test: PostgreSQL not available: {e}");
            return;
        }
    };
    let db = isolated.database().await.expect("Failed to get database");
    let gateway = common::MockGateway::start().await;
    let provider = common::MockPaymentProvider::start().await;
    let resources = common::test_resources(db.clone(), &gateway.base_url, &provider.base_url).await;
    let finalizer = ChargeFinalizer::new(resources);

    let owner = common::random_owner();
    let charge_id = finalizer
        .create_pending_charge(&owner, 1000, 30)
        .await
        .expect("Failed to create charge");

    // One minor unit of provider-side rounding is accepted
    let outcome = finalizer
        .finalize(&charge_id, 999, Some("pay_rounded"))
        .await
        .expect("Finalize within tolerance failed");
    assert_eq!(outcome, FinalizeOutcome::NewlyProvisioned);
}

#[tokio::test]
async fn test_finalize_renewal_extends_without_gateway_call() {
    common::init_test_logging();
    let isolated = match common::IsolatedPostgresDb::new().await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Skipping test: PostgreSQL not available: {e}");
            return;
        }
    };
    let db = isolated.database().await.expect("Failed to get database");
    let gateway = common::MockGateway::start().await;
    let provider = common::MockPaymentProvider::start().await;
    let resources = common::test_resources(db.clone(), &gateway.base_url, &provider.base_url).await;
    let finalizer = ChargeFinalizer::new(resources);

    let owner = common::random_owner();
    let first = finalizer
        .create_pending_charge(&owner, 1000, 30)
        .await
        .expect("Failed to create charge");
    finalizer
        .finalize(&first, 1000, Some("pay_first"))
        .await
        .expect("First finalize failed");
    let activated = db
        .get_entitlement(&owner)
        .await
        .expect("Query failed")
        .expect("Entitlement missing");
    assert_eq!(gateway.add_attempts(), 1);

    let second = finalizer
        .create_pending_charge(&owner, 1000, 30)
        .await
        .expect("Failed to create charge");
    let outcome = finalizer
        .finalize(&second, 1000, Some("pay_second"))
        .await
        .expect("Renewal finalize failed");
    assert_eq!(outcome, FinalizeOutcome::Renewed);

    let renewed = db
        .get_entitlement(&owner)
        .await
        .expect("Query failed")
        .expect("Entitlement missing");
    // The credential must survive a renewal byte for byte
    assert_eq!(renewed.credential_id, activated.credential_id);
    assert_eq!(renewed.secret_material, activated.secret_material);
    let extension = renewed.valid_until - activated.valid_until;
    assert_eq!(extension.num_days(), 30);
    assert_eq!(gateway.add_attempts(), 1, "Renewal must never hit the gateway");
}

#[tokio::test]
async fn test_finalize_rejects_replayed_payment_reference() {
    common::init_test_logging();
    let isolated = match common::IsolatedPostgresDb::new().await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Skipping test: PostgreSQL not available: {e}");
            return;
        }
    };
    let db = isolated.database().await.expect("Failed to get database");
    let gateway = common::MockGateway::start().await;
    let provider = common::MockPaymentProvider::start().await;
    let resources = common::test_resources(db.clone(), &gateway.base_url, &provider.base_url).await;
    let finalizer = ChargeFinalizer::new(resources);

    let owner_a = common::random_owner();
    let owner_b = common::random_owner();
    let charge_a = finalizer
        .create_pending_charge(&owner_a, 1000, 30)
        .await
        .expect("Failed to create charge");
    let charge_b = finalizer
        .create_pending_charge(&owner_b, 1000, 30)
        .await
        .expect("Failed to create charge");

    finalizer
        .finalize(&charge_a, 1000, Some("pay_replayed"))
        .await
        .expect("First finalize failed");

    // Same provider payment reference under a different charge id: the
    // receipt's unique constraint rolls the whole transaction back
    let err = finalizer
        .finalize(&charge_b, 1000, Some("pay_replayed"))
        .await
        .expect_err("Replayed payment reference should fail");
    assert!(err.is_conflict(), "Expected conflict, got: {err}");

    let charge = db
        .get_pending_charge(&charge_b)
        .await
        .expect("Query failed")
        .expect("Charge missing");
    assert_eq!(charge.status, ChargeStatus::Pending);
    assert!(db.get_entitlement(&owner_b).await.expect("Query failed").is_none());
}

#[tokio::test]
async fn test_finalize_unknown_charge_is_not_found() {
    common::init_test_logging();
    let isolated = match common::IsolatedPostgresDb::new().await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Skipping test: PostgreSQL not available: {e}");
            return;
        }
    };
    let db = isolated.database().await.expect("Failed to get database");
    let gateway = common::MockGateway::start().await;
    let provider = common::MockPaymentProvider::start().await;
    let resources = common::test_resources(db, &gateway.base_url, &provider.base_url).await;
    let finalizer = ChargeFinalizer::new(resources);

    let err = finalizer
        .finalize("no_such_charge", 1000, None)
        .await
        .expect_err("Unknown charge should fail");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_finalize_defers_when_gateway_is_down() {
    common::init_test_logging();
    let isolated = match common::IsolatedPostgresDb::new().await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Skipping test: PostgreSQL not available: {e}");
            return;
        }
    };
    let db = isolated.database().await.expect("Failed to get database");
    let gateway = common::MockGateway::start().await;
    let provider = common::MockPaymentProvider::start().await;
    let resources = common::test_resources(db.clone(), &gateway.base_url, &provider.base_url).await;
    let finalizer = ChargeFinalizer::new(resources);

    gateway.fail_next_adds(10);

    let owner = common::random_owner();
    let charge_id = finalizer
        .create_pending_charge(&owner, 1000, 30)
        .await
        .expect("Failed to create charge");

    // The payment side still commits; provisioning waits for the worker
    let outcome = finalizer
        .finalize(&charge_id, 1000, Some("pay_deferred"))
        .await
        .expect("Finalize failed");
    assert_eq!(outcome, FinalizeOutcome::ProvisioningDeferred);

    let entitlement = db
        .get_entitlement(&owner)
        .await
        .expect("Query failed")
        .expect("Entitlement missing");
    assert_eq!(entitlement.lifecycle_state, LifecycleState::ProvisioningPending);
    assert_eq!(entitlement.provisioning_attempts, 1);
    assert!(entitlement.last_provisioning_error.is_some());
}
