// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telemetry initialization.
//!
//! The control plane runs in one of two logging profiles: the compact
//! default for serving, and a verbose development profile behind the
//! `--debug` flag. `RUST_LOG` overrides either.

use std::io;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Logging profile for the control plane.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Default log level if RUST_LOG is not set.
    pub default_level: Level,

    /// Include file/line locations and span enter/close events. Costs
    /// output volume; only wanted while debugging message flows.
    pub verbose: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            verbose: false,
        }
    }
}

impl TelemetryConfig {
    /// Profile backing the `--debug` flag: debug-level, with locations and
    /// span events so per-conversation handling can be traced.
    pub fn development() -> Self {
        Self {
            default_level: Level::DEBUG,
            verbose: true,
        }
    }
}

/// Guard that flushes telemetry on drop.
///
/// Keep this guard alive for the duration of your program.
pub struct TelemetryGuard {
    _private: (),
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Reserved for flushing exporters
    }
}

/// Initialize telemetry with the given profile.
///
/// This should be called once at application startup. The `RUST_LOG`
/// environment variable takes precedence over the profile's level.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}", config.default_level)));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.verbose {
        registry
            .with(
                fmt::layer()
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE),
            )
            .try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    Ok(TelemetryGuard { _private: () })
}
