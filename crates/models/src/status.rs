use crate::{ViewPath, ViewState};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// StatusSnapshot is the JSON-compatible rendering of a view's scheduling
/// state, as published on the listener bus and returned to status queries.
/// Fields that don't apply to the state variant are omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub label: String,
    pub view_path: ViewPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_errors: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation_timestamp: Option<i64>,
}

impl From<&ViewState> for StatusSnapshot {
    fn from(state: &ViewState) -> Self {
        let (with_errors, incomplete, transformation_timestamp) = match state {
            ViewState::Waiting {
                with_errors,
                incomplete,
                ..
            }
            | ViewState::Transforming {
                with_errors,
                incomplete,
                ..
            }
            | ViewState::Retrying {
                with_errors,
                incomplete,
                ..
            } => (Some(*with_errors), Some(*incomplete), None),
            ViewState::Materialized {
                transformation_timestamp,
                with_errors,
                incomplete,
                ..
            } => (
                Some(*with_errors),
                Some(*incomplete),
                Some(*transformation_timestamp),
            ),
            _ => (None, None, None),
        };

        Self {
            label: state.label().to_string(),
            view_path: state.view().path.clone(),
            with_errors,
            incomplete,
            transformation_timestamp,
        }
    }
}
