// ABOUTME: Periodic worker harness with hard per-iteration timeouts and error containment
// ABOUTME: Workers coordinate only through database rows, never in-memory state
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

/// Activation worker: provisions pending entitlements at the gateway
pub mod activation;
/// Expiry worker: revokes credentials past their validity window
pub mod expiry;
/// Renewal worker: extends near-expiry entitlements from prepaid balance
pub mod renewal;

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error};

use crate::context::ServerResources;
use crate::database::STORE_DEPENDENCY;
use crate::errors::{AppError, AppResult};
use crate::payments::PaymentWatcher;

/// One periodic background task
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Worker name for logs
    fn name(&self) -> &'static str;

    /// Run one bounded iteration
    ///
    /// Per-row failures must be contained inside the iteration; an error
    /// escaping here means the iteration itself could not run (e.g. the
    /// claim query failed) and counts against the store breaker.
    async fn tick(&self) -> AppResult<()>;
}

/// Run a worker forever on a fixed interval
///
/// Every iteration runs under a hard wall-clock timeout so a stuck
/// dependency can never block the worker permanently; a timed-out or failed
/// iteration is logged and retried next cycle after a minimum delay, and
/// never crashes the process.
pub async fn run_worker<W: Worker>(worker: W, resources: ServerResources, period: Duration) {
    let workers_config = &resources.config.workers;
    let iteration_timeout = workers_config.iteration_timeout;
    let min_retry_delay = workers_config.min_retry_delay;
    let store_breaker = resources.breakers.get(STORE_DEPENDENCY);

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if !store_breaker.allow_request() {
            continue;
        }

        match timeout(iteration_timeout, worker.tick()).await {
            Ok(Ok(())) => {
                store_breaker.record_success();
                debug!(worker = worker.name(), "Iteration completed");
            }
            Ok(Err(e)) => {
                if matches!(e, AppError::Database(_)) {
                    store_breaker.record_failure();
                }
                error!(worker = worker.name(), error = %e, "Iteration failed");
                sleep(min_retry_delay).await;
            }
            Err(_) => {
                error!(
                    worker = worker.name(),
                    timeout_secs = iteration_timeout.as_secs(),
                    "Iteration exceeded its wall-clock budget, abandoning"
                );
                sleep(min_retry_delay).await;
            }
        }
    }
}

/// Spawn all periodic workers as independent tasks
pub fn spawn_workers(resources: &ServerResources) -> Vec<JoinHandle<()>> {
    let workers_config = &resources.config.workers;

    vec![
        tokio::spawn(run_worker(
            activation::ActivationWorker::new(resources.clone()),
            resources.clone(),
            workers_config.activation_interval,
        )),
        tokio::spawn(run_worker(
            expiry::ExpiryWorker::new(resources.clone()),
            resources.clone(),
            workers_config.expiry_interval,
        )),
        tokio::spawn(run_worker(
            renewal::RenewalWorker::new(resources.clone()),
            resources.clone(),
            workers_config.renewal_interval,
        )),
        tokio::spawn(run_worker(
            PaymentWatcher::new(resources.clone()),
            resources.clone(),
            workers_config.watcher_interval,
        )),
    ]
}
