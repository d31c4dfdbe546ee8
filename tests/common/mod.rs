// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared fixtures for the integration suites.
#![allow(dead_code, reason = "each suite uses a subset of the fixtures")]

use std::path::Path;
use std::sync::Arc;

use predator::sim::{PageScript, SimWorld, SimulatedBrowser};
use predator::{
    ActionContract, ActionContractBuilder, ActionSpec, ActionType, EngineConfig, PredatorEngine,
    RawElement, RawNetworkEvent, RuleCheck, SecurityPolicy, SelectorState, VerificationRule,
    WaitCondition, WaitKind,
};

/// A world with one app page: `#ready` visible, `/api/ping` returning 2xx.
pub fn app_world() -> Arc<SimWorld> {
    let world = SimWorld::new();
    world.route(
        "http://app.test/",
        PageScript::single_frame(
            "http://app.test/",
            vec![
                RawElement::new("status", "Ready", "div", "#ready"),
                RawElement::new("button", "Submit", "button", "#submit"),
            ],
        )
        .with_network(vec![
            RawNetworkEvent::request("GET", "http://app.test/"),
            RawNetworkEvent::response("GET", "http://app.test/", 200),
            RawNetworkEvent::request("GET", "http://app.test/api/ping"),
            RawNetworkEvent::json_response(
                "GET",
                "http://app.test/api/ping",
                200,
                serde_json::json!({"success": true}),
            ),
        ]),
    );
    world
}

/// An engine rooted under `dir`, driving the given world.
pub fn engine_on(dir: &Path, world: Arc<SimWorld>) -> PredatorEngine {
    let config = EngineConfig::rooted_at(dir);
    let browser = SimulatedBrowser::new(world);
    PredatorEngine::new(browser, config).expect("engine construction")
}

/// Policy allowing the `app.test` domain.
pub fn app_policy() -> SecurityPolicy {
    SecurityPolicy::allowing(["app.test"])
}

/// The Scenario A contract: navigate with selector + response waits and
/// network/url verification.
pub fn navigation_contract(workflow: &str, step: u32) -> ActionContract {
    ActionContractBuilder::new(workflow, "navigate home")
        .run_id("run-nav")
        .step_index(step)
        .action_spec(ActionSpec {
            action_type: ActionType::Navigate,
            url: Some("http://app.test/".into()),
            ..ActionSpec::wait_only()
        })
        .wait(WaitCondition {
            kind: WaitKind::Selector {
                selector: "#ready".into(),
                state: SelectorState::Visible,
                strict: false,
            },
            timeout_ms: Some(2_000),
        })
        .wait(WaitCondition {
            kind: WaitKind::Response {
                url_pattern: "/api/ping".into(),
                status_min: Some(200),
                status_max: Some(299),
            },
            timeout_ms: Some(2_000),
        })
        .verification(VerificationRule::hard(RuleCheck::NetworkStatus {
            url_pattern: Some("/api/ping".into()),
            status_min: 200,
            status_max: 299,
            since_seq: 0,
        }))
        .postcondition(VerificationRule::hard(RuleCheck::UrlPattern {
            pattern: "^http://app\\.test/$".into(),
        }))
        .build()
}
