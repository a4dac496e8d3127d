// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telemetry, tracing, and metrics infrastructure.
//!
//! Observability for the control plane:
//!
//! - **Tracing**: structured logging with spans for message handling,
//!   isolation operations, and cleanup cycles
//! - **Metrics**: lightweight counters and timings for monitored operations
//!
//! Initialize at startup:
//!
//! ```rust,ignore
//! use archon::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```

mod init;
pub mod metrics;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use metrics::{Metrics, OperationMetrics, GLOBAL_METRICS};
