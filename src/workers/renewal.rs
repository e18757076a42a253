// ABOUTME: Renewal worker extending near-expiry active entitlements from prepaid balance
// ABOUTME: Pure database work; the existing credential is never touched or regenerated
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use async_trait::async_trait;
use tracing::{error, info};

use crate::context::ServerResources;
use crate::errors::AppResult;
use crate::workers::Worker;

/// Auto-renews entitlements entering the expiry lookahead window
///
/// Deliberately has no gateway client: a renewal only moves `valid_until`,
/// and any path that would need a new credential belongs to activation.
pub struct RenewalWorker {
    resources: ServerResources,
}

impl RenewalWorker {
    /// Create the renewal worker
    #[must_use]
    pub const fn new(resources: ServerResources) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl Worker for RenewalWorker {
    fn name(&self) -> &'static str {
        "renewal"
    }

    async fn tick(&self) -> AppResult<()> {
        let workers_config = &self.resources.config.workers;
        let db = &self.resources.database;

        let claimed = db
            .claim_renewal_batch(
                workers_config.batch_size,
                workers_config.renewal_lookahead,
                workers_config.renewal_price,
                workers_config.iteration_timeout,
            )
            .await?;

        for entitlement in &claimed {
            match db
                .apply_renewal(
                    &entitlement.owner_id,
                    workers_config.renewal_price,
                    workers_config.renewal_period_days,
                )
                .await
            {
                Ok(true) => {
                    info!(
                        owner_id = entitlement.owner_id,
                        price = workers_config.renewal_price,
                        period_days = workers_config.renewal_period_days,
                        "Entitlement auto-renewed from balance"
                    );
                }
                Ok(false) => {
                    // Balance drained or state changed between claim and
                    // apply; the row was released and will be reconsidered
                    info!(
                        owner_id = entitlement.owner_id,
                        "Renewal candidate no longer eligible, skipped"
                    );
                }
                Err(e) => {
                    error!(
                        owner_id = entitlement.owner_id,
                        error = %e,
                        "Renewal attempt errored"
                    );
                }
            }
        }

        Ok(())
    }
}
