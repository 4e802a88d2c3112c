//! The pure scheduling state machine: given a view's current state and one
//! incoming event, produce the next state plus the set of scheduling actions
//! to perform. No I/O, no clock access, and no message sending: timestamps
//! and storage probes are passed in through [`StepContext`], which keeps
//! every transition a deterministic function of its inputs.

use models::{Listener, MaterializeMode, View, ViewPath, ViewState};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Event is one incoming occurrence targeting a view, grouped by originator.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A user, client, or dependent view asks for the view to be brought up
    /// to date.
    Materialize {
        mode: MaterializeMode,
        requester: Listener,
    },
    /// A user or client asks for the view to be invalidated.
    Invalidate { requester: Listener },
    /// A dependency completed with data.
    ViewMaterialized {
        dependency: ViewPath,
        transformation_timestamp: i64,
        with_errors: bool,
        incomplete: bool,
    },
    /// A dependency completed without data.
    ViewHasNoData { dependency: ViewPath },
    /// A dependency failed terminally.
    ViewFailed { dependency: ViewPath },
    /// The transformation executor finished the in-flight transformation.
    TransformationSucceeded { has_data: bool },
    /// The transformation executor gave up on the in-flight transformation.
    TransformationFailed,
    /// The armed backoff timer fired.
    Retry,
    /// The metadata store answered a lookup for an external view.
    MetadataForMaterialize {
        version: String,
        timestamp: i64,
        mode: MaterializeMode,
        requester: Listener,
    },
    /// The metadata lookup for an external view errored or timed out.
    MetadataFetchFailed { requester: Listener },
}

/// Action is one scheduling effect the supervisor must perform after a
/// transition. Listener notifications logically follow the state update;
/// no other inter-action ordering may be relied upon.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Ask a dependency view to materialize.
    Materialize {
        view: ViewPath,
        mode: MaterializeMode,
    },
    /// Submit the view's transformation to the executor.
    Transform { view: ViewPath },
    /// Fetch version and timestamp for an external view; the answer re-enters
    /// the machine as `MetadataForMaterialize` or `MetadataFetchFailed`.
    RequestMetadata {
        view: ViewPath,
        mode: MaterializeMode,
        requester: Listener,
    },
    /// Persist a new transformation timestamp.
    WriteTransformationTimestamp { view: ViewPath, timestamp: i64 },
    /// Persist the current transformation code checksum.
    WriteTransformationChecksum { view: ViewPath },
    /// Create the `_SUCCESS` marker in the view's output directory.
    TouchSuccessFlag { view: ViewPath },
    /// Notify listeners of success.
    ReportMaterialized {
        view: ViewPath,
        listeners: Vec<Listener>,
        transformation_timestamp: i64,
        with_errors: bool,
        incomplete: bool,
    },
    /// Notify listeners of an empty result.
    ReportNoDataAvailable {
        view: ViewPath,
        listeners: Vec<Listener>,
    },
    /// Notify listeners of terminal failure.
    ReportFailed {
        view: ViewPath,
        listeners: Vec<Listener>,
    },
    /// Acknowledge an invalidate.
    ReportInvalidated {
        view: ViewPath,
        listeners: Vec<Listener>,
    },
    /// Reject an invalidate that is illegal in the current state.
    ReportNotInvalidated {
        view: ViewPath,
        listeners: Vec<Listener>,
    },
}

/// Contextual parameters of one step. The supervisor assembles these from
/// its clock, configuration, and cached persisted metadata so the machine
/// itself stays free of ambient state.
#[derive(Debug, Clone, PartialEq)]
pub struct StepContext {
    /// Current time, epoch milliseconds.
    pub now: i64,
    /// Failed attempts tolerated before the view is parked as failed.
    pub max_retries: u32,
    /// Whether the persisted transformation checksum equals the view's
    /// current transformation code version.
    pub checksum_matches: bool,
    /// Persisted transformation timestamp, 0 when never transformed.
    pub stored_timestamp: i64,
    /// Whether the `_SUCCESS` marker exists; only consulted for NoOp views.
    pub success_flag_exists: bool,
}

/// The outcome of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultingState {
    pub next: ViewState,
    pub actions: Vec<Action>,
}

impl ResultingState {
    fn unchanged(state: ViewState) -> Self {
        Self {
            next: state,
            actions: Vec::new(),
        }
    }
}

/// Apply `event` to `state`. Total over every `(state, event)` combination:
/// pairs without a defined transition return the unchanged state and no
/// actions, which is what makes stale retry timers and late dependency
/// reports harmless.
pub fn step(state: ViewState, event: Event, ctx: &StepContext) -> ResultingState {
    match event {
        Event::Materialize { mode, requester } => on_materialize(state, mode, requester, ctx),
        Event::Invalidate { requester } => on_invalidate(state, requester),
        Event::ViewMaterialized {
            dependency,
            transformation_timestamp,
            with_errors,
            incomplete,
        } => on_dependency_outcome(
            state,
            dependency,
            DependencyOutcome::Materialized {
                transformation_timestamp,
                with_errors,
                incomplete,
            },
            ctx,
        ),
        Event::ViewHasNoData { dependency } => {
            on_dependency_outcome(state, dependency, DependencyOutcome::NoData, ctx)
        }
        Event::ViewFailed { dependency } => {
            on_dependency_outcome(state, dependency, DependencyOutcome::Failed, ctx)
        }
        Event::TransformationSucceeded { has_data } => {
            on_transformation_succeeded(state, has_data, ctx)
        }
        Event::TransformationFailed => on_transformation_failed(state, ctx),
        Event::Retry => on_retry(state),
        Event::MetadataForMaterialize {
            timestamp,
            requester,
            ..
        } => on_metadata_for_materialize(state, timestamp, requester),
        Event::MetadataFetchFailed { requester } => on_metadata_fetch_failed(state, requester),
    }
}

fn on_materialize(
    state: ViewState,
    mode: MaterializeMode,
    requester: Listener,
    ctx: &StepContext,
) -> ResultingState {
    match state {
        // An attempt is already in flight: enqueue the requester, don't restart.
        ViewState::Waiting {
            view,
            mut listeners,
            dependencies_materializing,
            one_dependency_returned_data,
            dependencies_freshness,
            with_errors,
            incomplete,
            mode,
        } => {
            enqueue(&mut listeners, requester);
            ResultingState::unchanged(ViewState::Waiting {
                view,
                listeners,
                dependencies_materializing,
                one_dependency_returned_data,
                dependencies_freshness,
                with_errors,
                incomplete,
                mode,
            })
        }
        ViewState::Transforming {
            view,
            mut listeners,
            retry,
            with_errors,
            incomplete,
            mode,
        } => {
            enqueue(&mut listeners, requester);
            ResultingState::unchanged(ViewState::Transforming {
                view,
                listeners,
                retry,
                with_errors,
                incomplete,
                mode,
            })
        }
        ViewState::Retrying {
            view,
            mut listeners,
            retry,
            with_errors,
            incomplete,
            mode,
        } => {
            enqueue(&mut listeners, requester);
            ResultingState::unchanged(ViewState::Retrying {
                view,
                listeners,
                retry,
                with_errors,
                incomplete,
                mode,
            })
        }

        state => {
            let view = state.view().clone();
            let path = view.path.clone();

            // External views are never transformed here: their state is
            // computed from whatever the metadata store answers.
            if view.is_external {
                return ResultingState {
                    next: state,
                    actions: vec![Action::RequestMetadata {
                        view: path,
                        mode,
                        requester,
                    }],
                };
            }

            // NoOp views have neither dependencies nor transformation logic;
            // the success marker is the only readiness signal there is.
            if view.is_no_op() {
                return if ctx.success_flag_exists {
                    ResultingState {
                        next: ViewState::Materialized {
                            view,
                            transformation_timestamp: ctx.now,
                            with_errors: false,
                            incomplete: false,
                        },
                        actions: vec![Action::ReportMaterialized {
                            view: path,
                            listeners: vec![requester],
                            transformation_timestamp: ctx.now,
                            with_errors: false,
                            incomplete: false,
                        }],
                    }
                } else {
                    ResultingState {
                        next: ViewState::NoData { view },
                        actions: vec![Action::ReportNoDataAvailable {
                            view: path,
                            listeners: vec![requester],
                        }],
                    }
                };
            }

            if let MaterializeMode::SetOnly = mode {
                return ResultingState {
                    next: ViewState::Materialized {
                        view,
                        transformation_timestamp: ctx.now,
                        with_errors: false,
                        incomplete: false,
                    },
                    actions: vec![
                        Action::WriteTransformationTimestamp {
                            view: path.clone(),
                            timestamp: ctx.now,
                        },
                        Action::WriteTransformationChecksum { view: path.clone() },
                        Action::ReportMaterialized {
                            view: path,
                            listeners: vec![requester],
                            transformation_timestamp: ctx.now,
                            with_errors: false,
                            incomplete: false,
                        },
                    ],
                };
            }

            let dependencies: BTreeSet<ViewPath> = if mode.fans_out() {
                view.dependencies.iter().cloned().collect()
            } else {
                BTreeSet::new()
            };

            if dependencies.is_empty() {
                // Nothing to wait for; the waiting state would be left in the
                // same step, so go straight to the transform decision.
                return transform_or_materialize(view, vec![requester], mode, false, false, 0, ctx);
            }

            let actions = dependencies
                .iter()
                .map(|dependency| Action::Materialize {
                    view: dependency.clone(),
                    mode,
                })
                .collect();

            ResultingState {
                next: ViewState::Waiting {
                    view,
                    listeners: vec![requester],
                    dependencies_materializing: dependencies,
                    one_dependency_returned_data: false,
                    dependencies_freshness: 0,
                    with_errors: false,
                    incomplete: false,
                    mode,
                },
                actions,
            }
        }
    }
}

fn on_invalidate(state: ViewState, requester: Listener) -> ResultingState {
    let path = state.view().path.clone();

    if state.is_in_flight() {
        return ResultingState {
            next: state,
            actions: vec![Action::ReportNotInvalidated {
                view: path,
                listeners: vec![requester],
            }],
        };
    }

    let view = state.view().clone();
    ResultingState {
        next: ViewState::Invalidated { view },
        actions: vec![Action::ReportInvalidated {
            view: path,
            listeners: vec![requester],
        }],
    }
}

enum DependencyOutcome {
    Materialized {
        transformation_timestamp: i64,
        with_errors: bool,
        incomplete: bool,
    },
    NoData,
    Failed,
}

fn on_dependency_outcome(
    state: ViewState,
    dependency: ViewPath,
    outcome: DependencyOutcome,
    ctx: &StepContext,
) -> ResultingState {
    let (
        view,
        listeners,
        mut dependencies_materializing,
        mut one_dependency_returned_data,
        mut dependencies_freshness,
        mut with_errors,
        mut incomplete,
        mode,
    ) = match state {
        ViewState::Waiting {
            view,
            listeners,
            dependencies_materializing,
            one_dependency_returned_data,
            dependencies_freshness,
            with_errors,
            incomplete,
            mode,
        } => (
            view,
            listeners,
            dependencies_materializing,
            one_dependency_returned_data,
            dependencies_freshness,
            with_errors,
            incomplete,
            mode,
        ),
        // A late report for an attempt that already concluded.
        state => return ResultingState::unchanged(state),
    };

    if !dependencies_materializing.remove(&dependency) {
        // Not a dependency we are waiting on; a duplicate or stray report.
        return ResultingState::unchanged(ViewState::Waiting {
            view,
            listeners,
            dependencies_materializing,
            one_dependency_returned_data,
            dependencies_freshness,
            with_errors,
            incomplete,
            mode,
        });
    }

    match outcome {
        DependencyOutcome::Materialized {
            transformation_timestamp,
            with_errors: dependency_with_errors,
            incomplete: dependency_incomplete,
        } => {
            one_dependency_returned_data = true;
            dependencies_freshness = dependencies_freshness.max(transformation_timestamp);
            with_errors |= dependency_with_errors;
            incomplete |= dependency_incomplete;
        }
        DependencyOutcome::NoData => incomplete = true,
        DependencyOutcome::Failed => with_errors = true,
    }

    if !dependencies_materializing.is_empty() {
        return ResultingState::unchanged(ViewState::Waiting {
            view,
            listeners,
            dependencies_materializing,
            one_dependency_returned_data,
            dependencies_freshness,
            with_errors,
            incomplete,
            mode,
        });
    }

    // Fan-in complete.
    if !one_dependency_returned_data {
        let path = view.path.clone();
        return ResultingState {
            next: ViewState::NoData { view },
            actions: vec![Action::ReportNoDataAvailable {
                view: path,
                listeners,
            }],
        };
    }

    transform_or_materialize(
        view,
        listeners,
        mode,
        with_errors,
        incomplete,
        dependencies_freshness,
        ctx,
    )
}

/// Decide, for a view whose dependencies (if any) are settled, whether the
/// transformation must actually run. Under the default mode an unchanged
/// checksum and no fresher dependency mean the stored result still stands.
fn transform_or_materialize(
    view: Arc<View>,
    listeners: Vec<Listener>,
    mode: MaterializeMode,
    with_errors: bool,
    incomplete: bool,
    dependencies_freshness: i64,
    ctx: &StepContext,
) -> ResultingState {
    let path = view.path.clone();

    let up_to_date = matches!(mode, MaterializeMode::Default)
        && ctx.checksum_matches
        && dependencies_freshness <= ctx.stored_timestamp;

    if up_to_date {
        ResultingState {
            next: ViewState::Materialized {
                view,
                transformation_timestamp: ctx.stored_timestamp,
                with_errors,
                incomplete,
            },
            actions: vec![Action::ReportMaterialized {
                view: path,
                listeners,
                transformation_timestamp: ctx.stored_timestamp,
                with_errors,
                incomplete,
            }],
        }
    } else {
        ResultingState {
            next: ViewState::Transforming {
                view,
                listeners,
                retry: 0,
                with_errors,
                incomplete,
                mode,
            },
            actions: vec![Action::Transform { view: path }],
        }
    }
}

fn on_transformation_succeeded(
    state: ViewState,
    has_data: bool,
    ctx: &StepContext,
) -> ResultingState {
    let (view, listeners, with_errors, incomplete) = match state {
        ViewState::Transforming {
            view,
            listeners,
            with_errors,
            incomplete,
            ..
        } => (view, listeners, with_errors, incomplete),
        state => return ResultingState::unchanged(state),
    };
    let path = view.path.clone();

    if !has_data {
        return ResultingState {
            next: ViewState::NoData { view },
            actions: vec![Action::ReportNoDataAvailable {
                view: path,
                listeners,
            }],
        };
    }

    ResultingState {
        next: ViewState::Materialized {
            view,
            transformation_timestamp: ctx.now,
            with_errors,
            incomplete,
        },
        actions: vec![
            Action::WriteTransformationTimestamp {
                view: path.clone(),
                timestamp: ctx.now,
            },
            Action::WriteTransformationChecksum { view: path.clone() },
            Action::TouchSuccessFlag { view: path.clone() },
            Action::ReportMaterialized {
                view: path,
                listeners,
                transformation_timestamp: ctx.now,
                with_errors,
                incomplete,
            },
        ],
    }
}

fn on_transformation_failed(state: ViewState, ctx: &StepContext) -> ResultingState {
    let (view, listeners, retry, with_errors, incomplete, mode) = match state {
        ViewState::Transforming {
            view,
            listeners,
            retry,
            with_errors,
            incomplete,
            mode,
        } => (view, listeners, retry, with_errors, incomplete, mode),
        state => return ResultingState::unchanged(state),
    };

    if retry < ctx.max_retries {
        // The supervisor arms the backoff timer on entry to retrying.
        return ResultingState {
            next: ViewState::Retrying {
                view,
                listeners,
                retry: retry + 1,
                with_errors,
                incomplete,
                mode,
            },
            actions: Vec::new(),
        };
    }

    let path = view.path.clone();
    ResultingState {
        next: ViewState::Failed { view },
        actions: vec![Action::ReportFailed {
            view: path,
            listeners,
        }],
    }
}

fn on_retry(state: ViewState) -> ResultingState {
    // Stale timers fire in non-retrying states and are ignored.
    let (view, listeners, retry, with_errors, incomplete, mode) = match state {
        ViewState::Retrying {
            view,
            listeners,
            retry,
            with_errors,
            incomplete,
            mode,
        } => (view, listeners, retry, with_errors, incomplete, mode),
        state => return ResultingState::unchanged(state),
    };
    let path = view.path.clone();

    ResultingState {
        next: ViewState::Transforming {
            view,
            listeners,
            retry,
            with_errors,
            incomplete,
            mode,
        },
        actions: vec![Action::Transform { view: path }],
    }
}

fn on_metadata_for_materialize(
    state: ViewState,
    timestamp: i64,
    requester: Listener,
) -> ResultingState {
    if state.is_in_flight() {
        return ResultingState::unchanged(state);
    }
    let view = state.view().clone();
    let path = view.path.clone();

    if timestamp > 0 {
        ResultingState {
            next: ViewState::Materialized {
                view,
                transformation_timestamp: timestamp,
                with_errors: false,
                incomplete: false,
            },
            actions: vec![Action::ReportMaterialized {
                view: path,
                listeners: vec![requester],
                transformation_timestamp: timestamp,
                with_errors: false,
                incomplete: false,
            }],
        }
    } else {
        ResultingState {
            next: ViewState::NoData { view },
            actions: vec![Action::ReportNoDataAvailable {
                view: path,
                listeners: vec![requester],
            }],
        }
    }
}

fn on_metadata_fetch_failed(state: ViewState, requester: Listener) -> ResultingState {
    if state.is_in_flight() {
        return ResultingState::unchanged(state);
    }
    let view = state.view().clone();
    let path = view.path.clone();

    ResultingState {
        next: ViewState::Failed { view },
        actions: vec![Action::ReportFailed {
            view: path,
            listeners: vec![requester],
        }],
    }
}

fn enqueue(listeners: &mut Vec<Listener>, requester: Listener) {
    if !listeners.contains(&requester) {
        listeners.push(requester);
    }
}
