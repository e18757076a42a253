// ABOUTME: Core database management with embedded migrations for PostgreSQL
// ABOUTME: Owns the connection pool shared by the finalizer, workers, and HTTP routes
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

/// Pending charges, immutable receipts, and prepaid balances
pub mod charges;
/// Entitlement rows: row-locked lookups, lock-skip claim batches, conditional transitions
pub mod entitlements;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Pool, Postgres};
use tracing::info;

use crate::errors::{AppError, AppResult};

/// Dependency name used for the store's circuit breaker
pub const STORE_DEPENDENCY: &str = "store";

/// Database connection pool wrapper
///
/// The pool is the only resource genuinely shared across concurrent units;
/// its maximum size must exceed the sum of workers and concurrent request
/// handlers, which `ServerConfig::validate` enforces.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL and run all pending migrations
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or a migration fails.
    pub async fn new(database_url: &str, max_connections: u32) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| AppError::database(format!("Failed to connect to database: {e}")))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Wrap an existing pool without running migrations (test setup)
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the pool for advanced operations
    #[must_use]
    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Run all database migrations embedded at compile time
    ///
    /// # Errors
    ///
    /// Returns an error if any migration fails or the connection is lost.
    pub async fn migrate(&self) -> AppResult<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Migration failed: {e}")))?;

        info!("Database migrations completed");
        Ok(())
    }
}

/// Map a sqlx error, turning unique-constraint violations into conflicts
pub(crate) fn map_insert_error(e: sqlx::Error, conflict_message: &str) -> AppError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            return AppError::conflict(conflict_message);
        }
    }
    AppError::database(format!("Database operation failed: {e}"))
}
