// SPDX-License-Identifier: MIT OR Apache-2.0

//! Target binding: from an action spec to a concrete locator.
//!
//! Resolution order: explicit selector, then the element identity's best
//! selector hint (falling back to role+name, then text), then the first
//! selector candidate. Anything else is a bind failure.

use std::sync::Arc;

use predator_core::{ActionSpec, FailureCode, StructuredState};
use predator_driver::PageDriver;

use crate::EngineFailure;

/// A resolved locator with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundTarget {
    /// Element identity, when binding went through one.
    pub eid: Option<String>,
    /// Frame identity routing the locator.
    pub fid: Option<String>,
    /// The selector to drive.
    pub selector: String,
    /// Binding confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Binds action specs to locators against the current snapshot.
#[derive(Debug, Default)]
pub struct Navigator;

impl Navigator {
    fn selector_from_eid(state: &StructuredState, eid: &str) -> Option<(String, String)> {
        let element = state
            .interactive_elements
            .iter()
            .find(|element| element.eid == eid)?;
        if let Some(hint) = element.selector_hints.first() {
            return Some((hint.clone(), element.fid.clone()));
        }
        if !element.role.is_empty() && !element.name_short.is_empty() {
            return Some((
                format!("role={}[name=\"{}\"]", element.role, element.name_short),
                element.fid.clone(),
            ));
        }
        if !element.name_short.is_empty() {
            return Some((
                format!("text=\"{}\"", element.name_short),
                element.fid.clone(),
            ));
        }
        None
    }

    /// Bind an action spec against the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`FailureCode::TargetBindFailed`] when nothing resolves.
    pub fn bind_target(
        &self,
        spec: &ActionSpec,
        state: &StructuredState,
    ) -> Result<BoundTarget, EngineFailure> {
        if let Some(selector) = &spec.selector {
            return Ok(BoundTarget {
                eid: spec.target_eid.clone(),
                fid: spec.target_fid.clone(),
                selector: selector.clone(),
                confidence: 1.0,
            });
        }

        if let Some(eid) = &spec.target_eid
            && let Some((selector, fid)) = Self::selector_from_eid(state, eid)
        {
            return Ok(BoundTarget {
                eid: Some(eid.clone()),
                fid: Some(fid),
                selector,
                confidence: 0.9,
            });
        }

        if let Some(candidate) = spec.selector_candidates.first() {
            return Ok(BoundTarget {
                eid: spec.target_eid.clone(),
                fid: spec.target_fid.clone(),
                selector: candidate.clone(),
                confidence: 0.7,
            });
        }

        Err(EngineFailure::new(
            FailureCode::TargetBindFailed,
            "unable to bind target selector",
        ))
    }

    /// Resolve a frame id to the driver frame index by origin prefix.
    ///
    /// Absent or unknown frame ids route to the main frame.
    #[must_use]
    pub fn frame_index_for(
        &self,
        page: &Arc<dyn PageDriver>,
        state: &StructuredState,
        fid: Option<&str>,
    ) -> usize {
        let Some(fid) = fid else {
            return 0;
        };
        let Some(origin) = state
            .frame_summary
            .iter()
            .find(|frame| frame.fid == fid)
            .map(|frame| frame.origin.clone())
        else {
            return 0;
        };
        if origin.is_empty() {
            return 0;
        }
        page.frames()
            .iter()
            .find(|frame| frame.url.starts_with(&origin))
            .map_or(0, |frame| frame.index)
    }
}
