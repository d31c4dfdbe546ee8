// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed page snapshots, section deltas, and network summaries.
//!
//! All ids are content-derived; two identical DOMs under identical extractor
//! bounds produce identical ids and section hashes. Selector hints are
//! carried on elements for binding but excluded from the outward model
//! projection (only their hint id is exposed).

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One frame in the snapshot's frame tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FrameState {
    /// Stable frame id.
    pub fid: String,
    /// Parent frame id; `None` for the main frame.
    pub parent_fid: Option<String>,
    /// `scheme://host` origin, empty when unknown.
    pub origin: String,
    /// Truncated frame title.
    pub title_short: String,
    /// Whether the frame is rendered.
    pub visible: bool,
    /// Number of interactive elements extracted from this frame.
    pub interactive_count: u32,
}

/// One interactive element in the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InteractiveElementState {
    /// Stable element id.
    pub eid: String,
    /// Owning frame id.
    pub fid: String,
    /// ARIA role or tag name.
    pub role: String,
    /// Redacted, truncated accessible name.
    pub name_short: String,
    /// Input type or tag name.
    #[serde(rename = "type")]
    pub element_type: String,
    /// Whether the element accepts interaction.
    pub enabled: bool,
    /// Whether the element is visible in the viewport.
    pub visible: bool,
    /// Whether the element is a required form field.
    pub required: bool,
    /// Checked state for checkboxes/radios; `None` otherwise.
    pub checked: Option<bool>,
    /// Redacted, truncated current value.
    pub value_hint: Option<String>,
    /// Normalised `[x, y, w, h]` bounding box in viewport fractions.
    pub bbox_norm: [f64; 4],
    /// Hash over the ordered selector hint list.
    pub selector_hint_id: String,
    /// Binding stability estimate in `[0, 1]`.
    pub stability_score: f64,
    /// Raw selector hints; never serialized outward.
    #[serde(skip)]
    pub selector_hints: Vec<String>,
}

/// One form in the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FormState {
    /// Stable form id.
    pub form_id: String,
    /// Owning frame id.
    pub fid: String,
    /// Element ids of the form's fields.
    pub field_eids: Vec<String>,
    /// Count of required fields with no value.
    pub required_missing_count: u32,
    /// Element id of the submit control, if any.
    pub submit_eid: Option<String>,
    /// Element ids flagged `aria-invalid`.
    pub validation_error_eids: Vec<String>,
}

/// One user-visible error surfaced by the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VisibleErrorState {
    /// Stable error id.
    pub error_id: String,
    /// Owning frame id.
    pub fid: String,
    /// `banner` or `form`.
    pub kind: String,
    /// Redacted, truncated error text.
    pub text_short: String,
    /// Associated element id, when attributable.
    pub eid: Option<String>,
}

/// A failed or silently-failing network exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct NetworkFailure {
    /// `host/path[:2]` grouping key.
    pub route_key: String,
    /// HTTP status, `0` for transport failures.
    pub status: u16,
    /// `"<digit>xx"` class, `"none"` for transport failures.
    pub status_class: String,
    /// Stable signature of the failure cause.
    pub error_signature: String,
    /// Request-to-response latency.
    pub latency_ms: u64,
}

/// Aggregate of network events since a sequence watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default)]
pub struct NetworkSummary {
    /// Requests observed.
    pub total_requests: u64,
    /// Responses observed.
    pub total_responses: u64,
    /// Failures (HTTP >= 400, silent failures, transport failures).
    pub total_failures: u64,
    /// Bounded failure detail list.
    pub failures: Vec<NetworkFailure>,
}

/// Extraction cost counters attached to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct BudgetStats {
    /// Byte-based token estimate of the model projection.
    pub estimated_tokens: u64,
    /// Elements kept after bounding.
    pub element_count: u32,
    /// Frames kept after bounding.
    pub frame_count: u32,
    /// Errors kept after bounding.
    pub error_count: u32,
    /// Injection-filter hits across all extracted text.
    pub redaction_count: u32,
}

/// A typed page snapshot with content-derived identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StructuredState {
    /// `s_` + stable hash over the section hashes.
    pub state_id: String,
    /// Previous snapshot id, if chained.
    pub prev_state_id: Option<String>,
    /// Page URL at extraction time.
    pub url: String,
    /// Document readiness phase.
    pub page_phase: String,
    /// Ordered frame tree summary.
    pub frame_summary: Vec<FrameState>,
    /// Ordered interactive elements.
    pub interactive_elements: Vec<InteractiveElementState>,
    /// Ordered forms.
    pub forms: Vec<FormState>,
    /// Ordered visible errors.
    pub visible_errors: Vec<VisibleErrorState>,
    /// Network aggregate since session start.
    pub network_summary: NetworkSummary,
    /// Download references attached by the current action.
    pub downloads: Vec<Value>,
    /// Per-section content hashes (frames, elements, forms, errors,
    /// network, downloads, url).
    pub state_hashes: BTreeMap<String, String>,
    /// Extraction cost counters.
    pub budget_stats: BudgetStats,
}

impl StructuredState {
    /// The outward model projection: everything a caller may see.
    ///
    /// Selector hints are structurally absent (they are `#[serde(skip)]` on
    /// the element type), so this is a plain serialisation of the sections.
    #[must_use]
    pub fn model_projection(&self) -> Value {
        serde_json::json!({
            "url": self.url,
            "page_phase": self.page_phase,
            "frame_summary": self.frame_summary,
            "interactive_elements": self.interactive_elements,
            "forms": self.forms,
            "visible_errors": self.visible_errors,
            "network_summary": self.network_summary,
            "downloads": self.downloads,
        })
    }
}

/// One structural operation within a section diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaOp {
    /// An item appeared.
    Add {
        /// Item id.
        id: String,
        /// Full item projection.
        value: Value,
    },
    /// An item disappeared.
    Remove {
        /// Item id.
        id: String,
    },
    /// An item changed; only changed fields are carried.
    Update {
        /// Item id.
        id: String,
        /// Changed fields and their new values.
        changes: Value,
    },
    /// Initial snapshot: the whole bounded section.
    Replace {
        /// Total items in the section before bounding.
        count: u64,
        /// Bounded item list.
        items: Vec<Value>,
    },
}

/// Section-level structural diff between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct StateDelta {
    /// Snapshot the diff starts from; `None` for initial snapshots.
    #[serde(default)]
    pub prev_state_id: Option<String>,
    /// Snapshot the diff ends at.
    #[serde(default)]
    pub new_state_id: String,
    /// Names of sections whose hashes changed.
    #[serde(default)]
    pub changed_sections: Vec<String>,
    /// `(old, new)` hash pairs per changed section.
    #[serde(default)]
    pub section_hash_changes: BTreeMap<String, (String, String)>,
    /// Ops over interactive elements.
    #[serde(default)]
    pub element_ops: Vec<DeltaOp>,
    /// Ops over forms.
    #[serde(default)]
    pub form_ops: Vec<DeltaOp>,
    /// Ops over visible errors.
    #[serde(default)]
    pub error_ops: Vec<DeltaOp>,
    /// Replacement network summary when its hash changed.
    #[serde(default)]
    pub network_delta: Option<NetworkSummary>,
    /// Byte-based token estimate of this delta.
    #[serde(default)]
    pub token_estimate: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(eid: &str) -> InteractiveElementState {
        InteractiveElementState {
            eid: eid.into(),
            fid: "f_0011223344556677".into(),
            role: "button".into(),
            name_short: "Submit".into(),
            element_type: "submit".into(),
            enabled: true,
            visible: true,
            required: false,
            checked: None,
            value_hint: None,
            bbox_norm: [0.1, 0.2, 0.3, 0.05],
            selector_hint_id: "sh_8899aabbccddeeff".into(),
            stability_score: 0.8,
            selector_hints: vec!["#submit".into()],
        }
    }

    #[test]
    fn selector_hints_are_not_serialized() {
        let value = serde_json::to_value(element("e_1")).unwrap();
        assert!(value.get("selector_hints").is_none());
        assert_eq!(value["selector_hint_id"], "sh_8899aabbccddeeff");
        assert_eq!(value["type"], "submit");
    }

    #[test]
    fn model_projection_excludes_hashes_and_stats() {
        let state = StructuredState {
            state_id: "s_x".into(),
            prev_state_id: None,
            url: "http://example.test/".into(),
            page_phase: "complete".into(),
            frame_summary: vec![],
            interactive_elements: vec![element("e_1")],
            forms: vec![],
            visible_errors: vec![],
            network_summary: NetworkSummary::default(),
            downloads: vec![],
            state_hashes: BTreeMap::new(),
            budget_stats: BudgetStats::default(),
        };
        let projection = state.model_projection();
        assert!(projection.get("state_hashes").is_none());
        assert!(projection.get("budget_stats").is_none());
        assert_eq!(projection["interactive_elements"][0]["eid"], "e_1");
    }

    #[test]
    fn delta_ops_tag_on_op() {
        let op = DeltaOp::Update {
            id: "e_1".into(),
            changes: serde_json::json!({"enabled": false}),
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["op"], "update");
    }
}
