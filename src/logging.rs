// ABOUTME: Tracing subscriber initialization with env-filter support
// ABOUTME: RUST_LOG controls verbosity; defaults to info for the whole crate
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured logging for the server process
///
/// Safe to call once at startup; honors `RUST_LOG` when set.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
