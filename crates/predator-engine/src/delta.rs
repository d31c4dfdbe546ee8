// SPDX-License-Identifier: MIT OR Apache-2.0

//! Section-level structural diffs between snapshots.
//!
//! Ops are keyed by stable ids and emitted in sorted-id order so the same
//! pair of snapshots always yields the same delta. Initial snapshots emit
//! one bounded `replace` op per section.

use std::collections::BTreeMap;

use serde_json::Value;

use predator_core::{DeltaOp, StateDelta, StructuredState, estimate_tokens};

/// Produces bounded op-lists per snapshot section.
#[derive(Debug, Clone)]
pub struct DeltaTracker {
    max_ops_per_section: usize,
}

impl Default for DeltaTracker {
    fn default() -> Self {
        Self {
            max_ops_per_section: 24,
        }
    }
}

fn map_by_id(items: &[Value], key: &str) -> BTreeMap<String, Value> {
    items
        .iter()
        .filter_map(|item| {
            item.get(key)
                .and_then(Value::as_str)
                .map(|id| (id.to_string(), item.clone()))
        })
        .collect()
}

fn section_items(projection: &Value, section: &str) -> Vec<Value> {
    projection
        .get(section)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

impl DeltaTracker {
    /// Build a tracker with an explicit per-section op cap.
    #[must_use]
    pub fn new(max_ops_per_section: usize) -> Self {
        Self {
            max_ops_per_section,
        }
    }

    fn diff_collection(&self, prev: &[Value], new: &[Value], key: &str) -> Vec<DeltaOp> {
        let prev_map = map_by_id(prev, key);
        let new_map = map_by_id(new, key);
        let mut ops = Vec::new();

        for (id, value) in &new_map {
            if prev_map.contains_key(id) {
                continue;
            }
            ops.push(DeltaOp::Add {
                id: id.clone(),
                value: value.clone(),
            });
            if ops.len() >= self.max_ops_per_section {
                return ops;
            }
        }

        for id in prev_map.keys() {
            if new_map.contains_key(id) {
                continue;
            }
            ops.push(DeltaOp::Remove { id: id.clone() });
            if ops.len() >= self.max_ops_per_section {
                return ops;
            }
        }

        for (id, new_value) in &new_map {
            let Some(prev_value) = prev_map.get(id) else {
                continue;
            };
            if prev_value == new_value {
                continue;
            }
            let mut changes = serde_json::Map::new();
            if let (Value::Object(prev_fields), Value::Object(new_fields)) =
                (prev_value, new_value)
            {
                for (field, value) in new_fields {
                    if prev_fields.get(field) != Some(value) {
                        changes.insert(field.clone(), value.clone());
                    }
                }
            }
            ops.push(DeltaOp::Update {
                id: id.clone(),
                changes: Value::Object(changes),
            });
            if ops.len() >= self.max_ops_per_section {
                return ops;
            }
        }

        ops
    }

    fn replace_op(&self, items: &[Value]) -> DeltaOp {
        DeltaOp::Replace {
            count: items.len() as u64,
            items: items.iter().take(self.max_ops_per_section).cloned().collect(),
        }
    }

    /// Diff two snapshots (or baseline a first snapshot).
    #[must_use]
    pub fn diff(&self, previous: Option<&StructuredState>, current: &StructuredState) -> StateDelta {
        let new_projection = current.model_projection();

        let Some(previous) = previous else {
            let elements = section_items(&new_projection, "interactive_elements");
            let forms = section_items(&new_projection, "forms");
            let errors = section_items(&new_projection, "visible_errors");
            let mut section_hash_changes = BTreeMap::new();
            section_hash_changes.insert(
                "full_state".to_string(),
                (
                    String::new(),
                    current.state_hashes.get("url").cloned().unwrap_or_default(),
                ),
            );
            let token_estimate = estimate_tokens(&new_projection) as u64;
            return StateDelta {
                prev_state_id: None,
                new_state_id: current.state_id.clone(),
                changed_sections: vec!["full_state".to_string()],
                section_hash_changes,
                element_ops: vec![self.replace_op(&elements)],
                form_ops: vec![self.replace_op(&forms)],
                error_ops: vec![self.replace_op(&errors)],
                network_delta: Some(current.network_summary.clone()),
                token_estimate,
            };
        };

        let prev_projection = previous.model_projection();
        let mut changed_sections = Vec::new();
        let mut section_hash_changes = BTreeMap::new();
        for (section, new_hash) in &current.state_hashes {
            let prev_hash = previous
                .state_hashes
                .get(section)
                .cloned()
                .unwrap_or_default();
            if &prev_hash != new_hash {
                changed_sections.push(section.clone());
                section_hash_changes.insert(section.clone(), (prev_hash, new_hash.clone()));
            }
        }

        let element_ops = if changed_sections.iter().any(|section| section == "elements") {
            self.diff_collection(
                &section_items(&prev_projection, "interactive_elements"),
                &section_items(&new_projection, "interactive_elements"),
                "eid",
            )
        } else {
            vec![]
        };
        let form_ops = if changed_sections.iter().any(|section| section == "forms") {
            self.diff_collection(
                &section_items(&prev_projection, "forms"),
                &section_items(&new_projection, "forms"),
                "form_id",
            )
        } else {
            vec![]
        };
        let error_ops = if changed_sections.iter().any(|section| section == "errors") {
            self.diff_collection(
                &section_items(&prev_projection, "visible_errors"),
                &section_items(&new_projection, "visible_errors"),
                "error_id",
            )
        } else {
            vec![]
        };
        let network_delta = changed_sections
            .iter()
            .any(|section| section == "network")
            .then(|| current.network_summary.clone());

        let payload = serde_json::json!({
            "changed_sections": changed_sections,
            "section_hash_changes": section_hash_changes,
            "element_ops": element_ops,
            "form_ops": form_ops,
            "error_ops": error_ops,
            "network_delta": network_delta,
        });

        StateDelta {
            prev_state_id: Some(previous.state_id.clone()),
            new_state_id: current.state_id.clone(),
            changed_sections,
            section_hash_changes,
            element_ops,
            form_ops,
            error_ops,
            network_delta,
            token_estimate: estimate_tokens(&payload) as u64,
        }
    }
}
