// SPDX-License-Identifier: MIT OR Apache-2.0
//! predator-engine
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Single-node deterministic action execution.
//!
//! The per-action state machine runs `pre_state → preconditions →
//! attempt_loop{arm_waits → dispatch → post_state → verify} → terminal`,
//! commits to at most one effect per contract, and emits budget-trimmed,
//! audited evidence. [`engine::PredatorEngine`] wires the whole node:
//! validation, quotas, leases, circuit breakers, security, idempotency.

/// Per-action state machine.
pub mod action;
/// Download/upload artifact lifecycle.
pub mod artifacts;
/// Engine configuration.
pub mod config;
/// Section-level structural diffs.
pub mod delta;
/// Single-node engine wiring.
pub mod engine;
/// Structured-state extraction.
pub mod extract;
/// Target binding.
pub mod navigator;
/// Domain and action gating.
pub mod security;
/// Action timelines and the telemetry sink.
pub mod telemetry;
/// Rule evaluation.
pub mod verify;
/// Event-driven composite waits.
pub mod waits;

use predator_core::FailureCode;

pub use action::ActionEngine;
pub use artifacts::{ArtifactError, ArtifactManager};
pub use config::EngineConfig;
pub use delta::DeltaTracker;
pub use engine::{EngineError, EngineHealthReport, PredatorEngine};
pub use extract::{ExtractorBounds, StructuredStateExtractor};
pub use navigator::{BoundTarget, Navigator};
pub use security::SecurityLayer;
pub use telemetry::{JsonlTelemetrySink, NullTelemetrySink, Telemetry, TelemetrySink};
pub use verify::{VerificationEngine, VerificationFailure, VerificationReport};
pub use waits::{ChaosPolicy, WaitManager, WaitMode, WaitOutcome};

/// A failed step inside one attempt: a stable code plus diagnostics.
///
/// This is the value form of every fault that can interrupt an attempt
/// (driver faults, wait timeouts, bind failures), so the retry loop can
/// key on the code without unwinding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFailure {
    /// Stable failure code.
    pub code: FailureCode,
    /// Human-readable detail for metadata.
    pub detail: String,
}

impl EngineFailure {
    /// Build a failure.
    #[must_use]
    pub fn new(code: FailureCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}
