use crate::{ClientId, MaterializeMode, View, ViewPath};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A party registered to be notified on the view's next terminal event:
/// either a dependent view, or an external subscriber addressed by its
/// opaque handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Listener {
    View(ViewPath),
    External(ClientId),
}

/// ViewState is the scheduling state of a single view. A view is in exactly
/// one state at any moment; all transitions between states are produced by
/// the pure scheduling state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewState {
    /// No metadata known for this view yet.
    CreatedFromScratch { view: Arc<View> },
    /// Metadata loaded from the schema manager at bootstrap.
    ReadFromSchemaManager {
        view: Arc<View>,
        version: String,
        last_transformed_at: i64,
    },
    /// Explicitly invalidated; only a re-materialize leaves this state.
    Invalidated { view: Arc<View> },
    /// Dependencies produced no data, or the source was empty.
    NoData { view: Arc<View> },
    /// Waiting for the dependency fan-in to complete.
    Waiting {
        view: Arc<View>,
        listeners: Vec<Listener>,
        dependencies_materializing: BTreeSet<ViewPath>,
        one_dependency_returned_data: bool,
        /// Largest transformation timestamp reported by a dependency so far.
        dependencies_freshness: i64,
        with_errors: bool,
        incomplete: bool,
        mode: MaterializeMode,
    },
    /// Transformation in flight. `retry` counts failed attempts so far.
    Transforming {
        view: Arc<View>,
        listeners: Vec<Listener>,
        retry: u32,
        with_errors: bool,
        incomplete: bool,
        mode: MaterializeMode,
    },
    /// Backoff armed after `retry` failed attempts.
    Retrying {
        view: Arc<View>,
        listeners: Vec<Listener>,
        retry: u32,
        with_errors: bool,
        incomplete: bool,
        mode: MaterializeMode,
    },
    /// Up to date as of `transformation_timestamp`.
    Materialized {
        view: Arc<View>,
        transformation_timestamp: i64,
        with_errors: bool,
        incomplete: bool,
    },
    /// Non-recoverable failure.
    Failed { view: Arc<View> },
}

impl ViewState {
    /// The view this state belongs to, regardless of variant.
    pub fn view(&self) -> &Arc<View> {
        match self {
            ViewState::CreatedFromScratch { view }
            | ViewState::ReadFromSchemaManager { view, .. }
            | ViewState::Invalidated { view }
            | ViewState::NoData { view }
            | ViewState::Waiting { view, .. }
            | ViewState::Transforming { view, .. }
            | ViewState::Retrying { view, .. }
            | ViewState::Materialized { view, .. }
            | ViewState::Failed { view } => view,
        }
    }

    /// The wire label of this state variant, in lower-case kebab form.
    pub fn label(&self) -> &'static str {
        match self {
            ViewState::CreatedFromScratch { .. } => "created",
            ViewState::ReadFromSchemaManager { .. } => "read-from-schema-manager",
            ViewState::Invalidated { .. } => "invalidated",
            ViewState::NoData { .. } => "no-data",
            ViewState::Waiting { .. } => "waiting",
            ViewState::Transforming { .. } => "transforming",
            ViewState::Retrying { .. } => "retrying",
            ViewState::Materialized { .. } => "materialized",
            ViewState::Failed { .. } => "failed",
        }
    }

    /// Whether a materialization attempt is currently in flight.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ViewState::Waiting { .. } | ViewState::Transforming { .. } | ViewState::Retrying { .. }
        )
    }

    /// Listeners enqueued for the current materialization attempt.
    pub fn listeners(&self) -> &[Listener] {
        match self {
            ViewState::Waiting { listeners, .. }
            | ViewState::Transforming { listeners, .. }
            | ViewState::Retrying { listeners, .. } => listeners,
            _ => &[],
        }
    }
}
