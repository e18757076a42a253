// ABOUTME: Integration tests for the activation worker and the shared provisioning routine
// ABOUTME: Covers claim exclusivity, transient retry, races, and operator disablement
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tollgate::context::ServerResources;
use tollgate::models::{ActivationOutcome, LifecycleState};
use tollgate::workers::activation::{provision_entitlement, ActivationWorker};
use tollgate::workers::Worker;

mod common;

#[tokio::test]
async fn test_activation_worker_provisions_pending_row() {
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

    let owner = common::random_owner();
    let valid_until = Utc::now() + ChronoDuration::days(30);
    common::seed_pending_entitlement(&db, &owner, valid_until).await;

    ActivationWorker::new(resources)
        .tick()
        .await
        .expect("Worker tick failed");

    let entitlement = db
        .get_entitlement(&owner)
        .await
        .expect("Query failed")
        .expect("Entitlement missing");
    assert_eq!(entitlement.lifecycle_state, LifecycleState::Active);
    assert!(entitlement.credential_id.is_some());
    assert_eq!(entitlement.provisioning_attempts, 0);
    assert_eq!(gateway.add_attempts(), 1);
}

#[tokio::test]
async fn test_transient_failure_retries_next_cycle() {
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

    let owner = common::random_owner();
    common::seed_pending_entitlement(&db, &owner, Utc::now() + ChronoDuration::days(30)).await;

    gateway.fail_next_adds(2);
    let worker = ActivationWorker::new(resources);

    worker.tick().await.expect("First tick failed");
    worker.tick().await.expect("Second tick failed");

    let after_failures = db
        .get_entitlement(&owner)
        .await
        .expect("Query failed")
        .expect("Entitlement missing");
    assert_eq!(
        after_failures.lifecycle_state,
        LifecycleState::ProvisioningPending
    );
    assert_eq!(after_failures.provisioning_attempts, 2);
    assert!(after_failures.last_provisioning_error.is_some());

    worker.tick().await.expect("Third tick failed");

    let activated = db
        .get_entitlement(&owner)
        .await
        .expect("Query failed")
        .expect("Entitlement missing");
    assert_eq!(activated.lifecycle_state, LifecycleState::Active);
    assert_eq!(activated.provisioning_attempts, 2);
    assert!(activated.last_provisioning_error.is_none());
    assert_eq!(gateway.add_attempts(), 3);
}

#[tokio::test]
async fn test_claim_lease_excludes_concurrent_claimers() {
    common::init_test_logging();
    let isolated = match common::IsolatedPostgresDb::new().await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Skipping test: PostgreSQL not available: {e}");
            return;
        }
    };
    let db = isolated.database().await.expect("Failed to get database");

    let owner = common::random_owner();
    common::seed_pending_entitlement(&db, &owner, Utc::now() + ChronoDuration::days(30)).await;

    let lease = Duration::from_secs(30);
    let first = db
        .claim_provisioning_batch(10, lease)
        .await
        .expect("First claim failed");
    assert_eq!(first.len(), 1);

    // The lease keeps a second claimer off the row even though the first
    // claim transaction has already committed
    let second = db
        .claim_provisioning_batch(10, lease)
        .await
        .expect("Second claim failed");
    assert!(second.is_empty(), "Leased row must not be claimable again");

    db.release_claim(&owner).await.expect("Release failed");
    let third = db
        .claim_provisioning_batch(10, lease)
        .await
        .expect("Third claim failed");
    assert_eq!(third.len(), 1);
}

#[tokio::test]
async fn test_lost_activation_race_removes_orphan_credential() {
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

    let owner = common::random_owner();
    common::seed_pending_entitlement(&db, &owner, Utc::now() + ChronoDuration::days(30)).await;

    let claimed = db
        .claim_owner_for_provisioning(&owner, Duration::from_secs(30))
        .await
        .expect("Claim failed")
        .expect("Row should be claimable");

    // Another process activates the row while our gateway call is in flight
    assert!(db
        .complete_activation(&owner, "winner_credential", "winner_secret")
        .await
        .expect("Competing activation failed"));

    let outcome = provision_entitlement(&resources, &claimed)
        .await
        .expect("Provisioning routine failed");
    assert_eq!(outcome, ActivationOutcome::AlreadyActivated);

    // The loser's freshly added credential is removed at the gateway and
    // the winner's row is untouched
    assert_eq!(gateway.remove_calls(), 1);
    let entitlement = db
        .get_entitlement(&owner)
        .await
        .expect("Query failed")
        .expect("Entitlement missing");
    assert_eq!(entitlement.credential_id.as_deref(), Some("winner_credential"));
}

#[tokio::test]
async fn test_concurrent_workers_never_duplicate_provisioning() {
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

    let owners: Vec<String> = (0..5).map(|_| common::random_owner()).collect();
    for owner in &owners {
        common::seed_pending_entitlement(&db, owner, Utc::now() + ChronoDuration::days(30)).await;
    }

    // Four workers race over the same pending rows; claim leases must hand
    // each row to exactly one of them
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let worker = ActivationWorker::new(resources.clone());
            tokio::spawn(async move { worker.tick().await })
        })
        .collect();
    for handle in handles {
        handle
            .await
            .expect("Worker task panicked")
            .expect("Worker tick failed");
    }

    assert_eq!(
        gateway.add_attempts(),
        owners.len(),
        "Each pending row must reach the gateway exactly once"
    );
    for owner in &owners {
        let entitlement = db
            .get_entitlement(owner)
            .await
            .expect("Query failed")
            .expect("Entitlement missing");
        assert_eq!(entitlement.lifecycle_state, LifecycleState::Active);
        assert!(entitlement.credential_id.is_some());
    }
}

#[tokio::test]
async fn test_attempt_ceiling_is_observability_only() {
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

    let mut config = common::test_config(&gateway.base_url, &provider.base_url);
    config.workers.max_provisioning_attempts = 2;
    let resources =
        ServerResources::new(config, db.clone()).expect("Failed to build server resources");

    let owner = common::random_owner();
    common::seed_pending_entitlement(&db, &owner, Utc::now() + ChronoDuration::days(30)).await;

    gateway.fail_next_adds(3);
    let worker = ActivationWorker::new(resources);
    for _ in 0..3 {
        worker.tick().await.expect("Worker tick failed");
    }

    // Crossing the ceiling warns operators but never flips the row terminal
    let past_ceiling = db
        .get_entitlement(&owner)
        .await
        .expect("Query failed")
        .expect("Entitlement missing");
    assert_eq!(
        past_ceiling.lifecycle_state,
        LifecycleState::ProvisioningPending
    );
    assert_eq!(past_ceiling.provisioning_attempts, 3);

    worker.tick().await.expect("Worker tick failed");
    let recovered = db
        .get_entitlement(&owner)
        .await
        .expect("Query failed")
        .expect("Entitlement missing");
    assert_eq!(recovered.lifecycle_state, LifecycleState::Active);
}

#[tokio::test]
async fn test_disabled_provisioning_fails_terminally() {
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

    let mut config = common::test_config(&gateway.base_url, &provider.base_url);
    config.gateway.provisioning_enabled = false;
    let resources =
        ServerResources::new(config, db.clone()).expect("Failed to build server resources");

    let owner = common::random_owner();
    common::seed_pending_entitlement(&db, &owner, Utc::now() + ChronoDuration::days(30)).await;

    ActivationWorker::new(resources)
        .tick()
        .await
        .expect("Worker tick failed");

    let entitlement = db
        .get_entitlement(&owner)
        .await
        .expect("Query failed")
        .expect("Entitlement missing");
    assert_eq!(entitlement.lifecycle_state, LifecycleState::Failed);
    assert!(entitlement.last_provisioning_error.is_some());
    assert_eq!(gateway.add_attempts(), 0, "Disabled gateway must not be called");
}
