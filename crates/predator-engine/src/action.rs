// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-action state machine.
//!
//! `pre_state → preconditions → attempt_loop{arm_waits → dispatch →
//! post_state → verify} → terminal`. The engine commits to at most one
//! effect per contract: waits are pre-armed before dispatch, precondition
//! failures never retry, and only configured failure codes re-enter the
//! loop. Backoff is exponential with a cap.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::debug;

use predator_core::{
    ActionContract, ActionExecutionResult, ActionType, ArtifactRecord, FailureCode,
    StructuredState,
};
use predator_session::RuntimeTelemetryBuffer;

use crate::artifacts::ArtifactManager;
use crate::delta::DeltaTracker;
use crate::extract::StructuredStateExtractor;
use crate::navigator::Navigator;
use crate::telemetry::Telemetry;
use crate::verify::VerificationEngine;
use crate::waits::{WaitManager, WaitMode};
use crate::EngineFailure;

fn dispatch_fault(error: predator_driver::DriverError) -> EngineFailure {
    EngineFailure::new(FailureCode::ActionExecutionFailed, error.to_string())
}

/// Executes one contract against one page, deterministically.
pub struct ActionEngine {
    navigator: Navigator,
    waits: WaitManager,
    verifier: VerificationEngine,
    extractor: StructuredStateExtractor,
    delta: DeltaTracker,
    artifacts: Arc<ArtifactManager>,
    runtime_telemetry: Option<Arc<RuntimeTelemetryBuffer>>,
}

impl ActionEngine {
    /// Wire an action engine from its collaborators.
    #[must_use]
    pub fn new(
        navigator: Navigator,
        waits: WaitManager,
        verifier: VerificationEngine,
        extractor: StructuredStateExtractor,
        delta: DeltaTracker,
        artifacts: Arc<ArtifactManager>,
        runtime_telemetry: Option<Arc<RuntimeTelemetryBuffer>>,
    ) -> Self {
        Self {
            navigator,
            waits,
            verifier,
            extractor,
            delta,
            artifacts,
            runtime_telemetry,
        }
    }

    async fn dispatch_action(
        &self,
        contract: &ActionContract,
        state: &StructuredState,
        workflow_id: &str,
        action_id: &str,
    ) -> Result<Vec<ArtifactRecord>, EngineFailure> {
        let spec = &contract.action_spec;
        let page = self.waits.page();
        let timeout = Duration::from_millis(contract.timeout.execute_timeout_ms);

        match spec.action_type {
            ActionType::Navigate => {
                let url = spec.url.as_deref().ok_or_else(|| {
                    EngineFailure::new(FailureCode::ActionExecutionFailed, "navigate requires url")
                })?;
                page.goto(url, timeout).await.map_err(dispatch_fault)?;
                Ok(vec![])
            }
            ActionType::WaitOnly => Ok(vec![]),
            ActionType::CustomJsRestricted => {
                let expression = spec.js_expression.as_deref().ok_or_else(|| {
                    EngineFailure::new(
                        FailureCode::ActionExecutionFailed,
                        "custom_js_restricted requires js_expression",
                    )
                })?;
                page.evaluate(expression, spec.js_argument.clone())
                    .await
                    .map_err(dispatch_fault)?;
                Ok(vec![])
            }
            ActionType::Click
            | ActionType::Type
            | ActionType::Select
            | ActionType::Upload
            | ActionType::DownloadTrigger => {
                let target = self.navigator.bind_target(spec, state)?;
                let frame = self
                    .navigator
                    .frame_index_for(&page, state, target.fid.as_deref());

                match spec.action_type {
                    ActionType::Click => {
                        page.click(frame, &target.selector, timeout)
                            .await
                            .map_err(dispatch_fault)?;
                        Ok(vec![])
                    }
                    ActionType::Type => {
                        page.fill(frame, &target.selector, spec.text.as_deref().unwrap_or(""), timeout)
                            .await
                            .map_err(dispatch_fault)?;
                        Ok(vec![])
                    }
                    ActionType::Select => {
                        page.select_option(
                            frame,
                            &target.selector,
                            spec.select_value.as_deref().unwrap_or(""),
                            timeout,
                        )
                        .await
                        .map_err(dispatch_fault)?;
                        Ok(vec![])
                    }
                    ActionType::Upload => {
                        let artifact_id = spec.upload_artifact_id.as_deref().ok_or_else(|| {
                            EngineFailure::new(
                                FailureCode::ActionExecutionFailed,
                                "upload requires upload_artifact_id",
                            )
                        })?;
                        let record = self.artifacts.get_record(artifact_id).ok_or_else(|| {
                            EngineFailure::new(
                                FailureCode::ActionExecutionFailed,
                                format!("unknown upload artifact: {artifact_id}"),
                            )
                        })?;
                        page.set_input_files(frame, &target.selector, &record.path, timeout)
                            .await
                            .map_err(dispatch_fault)?;
                        Ok(vec![record])
                    }
                    ActionType::DownloadTrigger => {
                        // Arm the expectation before the triggering click.
                        let waiter = page.arm_download().await.map_err(dispatch_fault)?;
                        page.click(frame, &target.selector, timeout)
                            .await
                            .map_err(dispatch_fault)?;
                        let payload = waiter.wait(timeout).await.map_err(dispatch_fault)?;
                        let record = self
                            .artifacts
                            .save_download(workflow_id, action_id, payload)
                            .await
                            .map_err(|error| {
                                EngineFailure::new(
                                    FailureCode::ActionExecutionFailed,
                                    error.to_string(),
                                )
                            })?;
                        Ok(vec![record])
                    }
                    _ => unreachable!("outer match covers locator actions"),
                }
            }
        }
    }

    fn terminal_failure(
        contract: &ActionContract,
        action_id: &str,
        failure: &EngineFailure,
        attempts: u32,
        pre_state_id: Option<&str>,
        post_state_id: Option<&str>,
        telemetry: &Telemetry,
        metadata: Value,
    ) -> ActionExecutionResult {
        ActionExecutionResult {
            action_id: action_id.to_string(),
            success: false,
            failure_code: Some(failure.code),
            attempts,
            escalation: Some(contract.escalation.on_exhausted_retries),
            verification_passed: false,
            pre_state_id: pre_state_id.map(ToString::to_string),
            post_state_id: post_state_id.map(ToString::to_string),
            state_delta: Default::default(),
            network_summary: Default::default(),
            telemetry: telemetry.snapshot(),
            artifacts: vec![],
            metadata,
        }
    }

    /// Execute one contract. Always returns a result, never unwinds.
    pub async fn execute(
        &self,
        contract: &ActionContract,
        workflow_id: &str,
        action_id: &str,
    ) -> ActionExecutionResult {
        let mut telemetry = Telemetry::new();
        telemetry.event(
            "action_start",
            json!({"action_id": action_id, "intent": contract.intent}),
        );

        if contract.action_spec.action_type != ActionType::WaitOnly && !contract.has_post_guard() {
            return ActionExecutionResult {
                action_id: action_id.to_string(),
                success: false,
                failure_code: Some(FailureCode::MissingPostActionGuard),
                attempts: 1,
                escalation: None,
                verification_passed: false,
                pre_state_id: None,
                post_state_id: None,
                state_delta: Default::default(),
                network_summary: Default::default(),
                telemetry: telemetry.snapshot(),
                artifacts: vec![],
                metadata: json!({
                    "detail": "Non-wait action requires wait_conditions or verification rules",
                }),
            };
        }

        let pre_state = match self.extractor.extract(None, &[]).await {
            Ok(state) => state,
            Err(failure) => {
                return ActionExecutionResult::failure(action_id, failure.code, failure.detail);
            }
        };
        telemetry.event("pre_state_extracted", json!({"state_id": pre_state.state_id}));

        let preconditions = match self.verifier.verify(&contract.preconditions, &pre_state).await {
            Ok(report) => report,
            Err(failure) => {
                return ActionExecutionResult::failure(action_id, failure.code, failure.detail);
            }
        };
        if !preconditions.passed {
            telemetry.event(
                "preconditions_failed",
                json!({"count": preconditions.failures.len()}),
            );
            return ActionExecutionResult {
                action_id: action_id.to_string(),
                success: false,
                failure_code: Some(FailureCode::PreconditionFailed),
                attempts: 1,
                escalation: None,
                verification_passed: false,
                pre_state_id: Some(pre_state.state_id.clone()),
                post_state_id: Some(pre_state.state_id.clone()),
                state_delta: Default::default(),
                network_summary: Default::default(),
                telemetry: telemetry.snapshot(),
                artifacts: vec![],
                metadata: json!({"precondition_failures": preconditions.failures}),
            };
        }

        let wait_timeout = Duration::from_millis(contract.timeout.wait_timeout_ms);
        let mut attempts: u32 = 0;
        let mut backoff_ms = contract.retry.initial_backoff_ms;

        while attempts < contract.retry.max_attempts {
            attempts += 1;
            telemetry.event("attempt_start", json!({"attempt": attempts}));

            let action_seq = self.extractor.network_sequence();
            let runtime_seq = self
                .runtime_telemetry
                .as_ref()
                .map_or(0, |buffer| buffer.sequence());

            let attempt = self
                .waits
                .execute_armed(
                    || self.dispatch_action(contract, &pre_state, workflow_id, action_id),
                    &contract.wait_conditions,
                    WaitMode::All,
                    wait_timeout,
                )
                .await;

            let failure = match attempt {
                Ok((artifacts, wait_outcomes)) => {
                    telemetry.event("action_dispatched", json!({"attempt": attempts}));
                    telemetry.event(
                        "wait_conditions_satisfied",
                        json!({"attempt": attempts, "count": wait_outcomes.len()}),
                    );

                    let downloads: Vec<Value> = artifacts
                        .iter()
                        .map(|record| {
                            json!({"artifact_id": record.artifact_id, "path": record.path})
                        })
                        .collect();
                    let post_state = match self
                        .extractor
                        .extract(Some(&pre_state.state_id), &downloads)
                        .await
                    {
                        Ok(state) => state,
                        Err(failure) => {
                            return ActionExecutionResult::failure(
                                action_id,
                                failure.code,
                                failure.detail,
                            );
                        }
                    };
                    telemetry
                        .event("post_state_extracted", json!({"state_id": post_state.state_id}));

                    // Attempt-level counters feed the telemetry snapshot on
                    // every terminal path, success or not.
                    let runtime_events = self
                        .runtime_telemetry
                        .as_ref()
                        .map(|buffer| buffer.events_since(runtime_seq))
                        .unwrap_or_default();
                    for event in &runtime_events {
                        match event.kind.as_str() {
                            "console" => telemetry.incr("console_count", 1),
                            "pageerror" => telemetry.incr("pageerror_count", 1),
                            _ => {}
                        }
                    }
                    let network_summary = self.extractor.network_summary_since(action_seq);
                    telemetry.incr("network_error_count", network_summary.total_failures);

                    let mut combined = contract.expected_postconditions.clone();
                    combined.extend(contract.verification_rules.iter().cloned());
                    let verification = match self.verifier.verify(&combined, &post_state).await {
                        Ok(report) => report,
                        Err(failure) => {
                            return ActionExecutionResult::failure(
                                action_id,
                                failure.code,
                                failure.detail,
                            );
                        }
                    };

                    if verification.passed {
                        telemetry.event("verification_passed", json!({"attempt": attempts}));
                        let delta = self.delta.diff(Some(&pre_state), &post_state);
                        let runtime_events: Vec<Value> = runtime_events
                            .into_iter()
                            .map(|event| {
                                json!({
                                    "seq": event.seq,
                                    "ts": event.ts,
                                    "kind": event.kind,
                                    "message": event.message,
                                })
                            })
                            .collect();

                        return ActionExecutionResult {
                            action_id: action_id.to_string(),
                            success: true,
                            failure_code: None,
                            attempts,
                            escalation: None,
                            verification_passed: true,
                            pre_state_id: Some(pre_state.state_id.clone()),
                            post_state_id: Some(post_state.state_id.clone()),
                            state_delta: delta,
                            network_summary,
                            telemetry: telemetry.snapshot(),
                            artifacts,
                            metadata: json!({
                                "runtime_events": runtime_events,
                                "guard_summary": {
                                    "wait_conditions": contract.wait_conditions.len(),
                                    "verification_rules": combined.len(),
                                },
                            }),
                        };
                    }

                    telemetry.event("verification_failed", json!({"attempt": attempts}));
                    let failure = EngineFailure::new(
                        FailureCode::PostconditionFailed,
                        "post-state verification failed",
                    );
                    let retryable = contract.retry.is_retryable(failure.code);
                    if !retryable || attempts >= contract.retry.max_attempts {
                        return Self::terminal_failure(
                            contract,
                            action_id,
                            &failure,
                            attempts,
                            Some(&pre_state.state_id),
                            Some(&post_state.state_id),
                            &telemetry,
                            json!({"verification_failures": verification.failures}),
                        );
                    }
                    failure
                }
                Err(failure) => {
                    telemetry.event(
                        "attempt_error",
                        json!({
                            "attempt": attempts,
                            "error": failure.detail,
                            "failure_code": failure.code,
                        }),
                    );
                    let retryable = contract.retry.is_retryable(failure.code);
                    if !retryable || attempts >= contract.retry.max_attempts {
                        return Self::terminal_failure(
                            contract,
                            action_id,
                            &failure,
                            attempts,
                            Some(&pre_state.state_id),
                            Some(&pre_state.state_id),
                            &telemetry,
                            json!({"exception": failure.detail}),
                        );
                    }
                    failure
                }
            };

            debug!(attempt = attempts, code = %failure.code, backoff_ms, "retrying after backoff");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = contract.retry.next_backoff_ms(backoff_ms);
        }

        ActionExecutionResult {
            action_id: action_id.to_string(),
            success: false,
            failure_code: Some(FailureCode::RetryExhausted),
            attempts,
            escalation: Some(contract.escalation.on_exhausted_retries),
            verification_passed: false,
            pre_state_id: Some(pre_state.state_id.clone()),
            post_state_id: Some(pre_state.state_id),
            state_delta: Default::default(),
            network_summary: Default::default(),
            telemetry: telemetry.snapshot(),
            artifacts: vec![],
            metadata: Value::Object(Default::default()),
        }
    }
}
