// ABOUTME: Unified error handling for the entitlement lifecycle core
// ABOUTME: Classifies failures into validation, conflict, transient, permanent, and invariant errors
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result alias used throughout the crate
pub type AppResult<T> = Result<T, AppError>;

/// Application-wide error type
///
/// The variants map directly onto the retry semantics callers need:
/// validation errors are surfaced immediately, conflicts are idempotency
/// short-circuits treated as success, transient dependency errors are
/// retried on the owning worker's schedule, and permanent dependency
/// errors are terminal until an operator intervenes.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad input (e.g. payment amount mismatch); never retried
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Idempotency short-circuit (e.g. already-finalized charge); callers treat as success
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// A dependency failed in a way that is expected to recover (timeout, 5xx, circuit open)
    #[error("Transient failure of {dependency}: {message}")]
    TransientDependency {
        /// Name of the failing dependency
        dependency: &'static str,
        /// Failure detail
        message: String,
    },

    /// A dependency is explicitly disabled; retrying cannot help
    #[error("Permanent failure of {dependency}: {message}")]
    PermanentDependency {
        /// Name of the failing dependency
        dependency: &'static str,
        /// Failure detail
        message: String,
    },

    /// A state transition that must never happen was requested; state is left untouched
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration is missing or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error that does not fit another category
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Bad input, surfaced immediately and never retried
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Idempotency short-circuit; safe to treat as success
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Entity lookup miss
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Database failure
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Recoverable dependency failure; retried by the owning worker
    pub fn transient(dependency: &'static str, msg: impl Into<String>) -> Self {
        Self::TransientDependency {
            dependency,
            message: msg.into(),
        }
    }

    /// Terminal dependency failure; requires operator attention
    pub fn permanent(dependency: &'static str, msg: impl Into<String>) -> Self {
        Self::PermanentDependency {
            dependency,
            message: msg.into(),
        }
    }

    /// State transition that must never happen
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Missing or malformed configuration
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Uncategorized internal failure
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a worker should retry this error on its normal schedule
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientDependency { .. })
    }

    /// Whether this error is an idempotency short-circuit
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Stable error code used in HTTP responses and structured logs
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Database(_) => "database_error",
            Self::TransientDependency { .. } => "transient_dependency",
            Self::PermanentDependency { .. } => "permanent_dependency",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal_error",
        }
    }

    const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::TransientDependency { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_)
            | Self::PermanentDependency { .. }
            | Self::InvariantViolation(_)
            | Self::Config(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}
