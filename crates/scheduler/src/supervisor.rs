//! The per-view supervisor: owns one view's scheduling state and the
//! single-consumer inbox through which every event targeting that view is
//! serialized. Each message is classified into a state-machine event, and
//! the machine's resulting actions are then dispatched: peer routing,
//! executor submission, metadata writes, retry timers, and listener
//! notification.
//!
//! The supervisor suspends only between messages. Everything it kicks off
//! (transformations, metadata fetches, timers, persistence) runs on spawned
//! tasks whose outcomes are posted back onto the inbox as messages.

use crate::gateways::{SchemaRegistry, VersionCheck, ViewMetadata};
use crate::listeners::BusEvent;
use crate::machine::{self, Action, Event, StepContext};
use crate::router::Router;
use chrono::Utc;
use models::{ClientId, Listener, MaterializeMode, StatusSnapshot, View, ViewPath, ViewState};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) const INBOX_CAPACITY: usize = 1024;

/// Envelope of every inter-supervisor message. `source` is the reporting
/// view, so recipients can attribute dependency completions.
#[derive(Debug, Clone)]
pub struct CommandForView {
    pub source: Option<ViewPath>,
    pub target: ViewPath,
    pub command: ViewCommand,
}

/// A message drained from a view supervisor's inbox.
#[derive(Debug, Clone)]
pub enum ViewCommand {
    Materialize {
        mode: MaterializeMode,
        requester: Requester,
    },
    Invalidate {
        requester: Requester,
    },
    /// A dependency (the envelope source) completed with data.
    ViewMaterialized {
        transformation_timestamp: i64,
        with_errors: bool,
        incomplete: bool,
    },
    /// A dependency (the envelope source) completed without data.
    ViewHasNoData,
    /// A dependency (the envelope source) failed terminally.
    ViewFailed,
    TransformationSucceeded {
        has_data: bool,
    },
    TransformationFailed,
    Retry,
    MetadataForMaterialize {
        version: String,
        timestamp: i64,
        mode: MaterializeMode,
        requester: Listener,
    },
    MetadataFetchFailed {
        requester: Listener,
    },
}

/// Who asked: a dependent view, or an external client carrying its reply
/// channel. The supervisor stashes client channels under their [`ClientId`]
/// so that only the opaque id enters the state machine.
#[derive(Debug, Clone)]
pub enum Requester {
    View(ViewPath),
    Client {
        id: ClientId,
        reply: mpsc::UnboundedSender<ViewEvent>,
    },
}

/// Notification delivered to an external subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewEvent {
    ViewMaterialized {
        view: ViewPath,
        transformation_timestamp: i64,
        with_errors: bool,
        incomplete: bool,
    },
    ViewHasNoData {
        view: ViewPath,
    },
    ViewFailed {
        view: ViewPath,
    },
    ViewInvalidated {
        view: ViewPath,
    },
    ViewNotInvalidated {
        view: ViewPath,
    },
}

pub(crate) struct ViewSupervisor {
    view: Arc<View>,
    state: ViewState,
    /// Persisted transformation checksum as this supervisor last saw it.
    stored_version: Option<String>,
    /// Persisted transformation timestamp, 0 when never transformed.
    stored_timestamp: i64,
    inbox: mpsc::Receiver<CommandForView>,
    self_inbox: mpsc::Sender<CommandForView>,
    router: Router,
    /// Cached peer inboxes, one entry per known view path.
    peers: HashMap<ViewPath, mpsc::Sender<CommandForView>>,
    /// Reply channels of external subscribers currently enqueued as
    /// listeners; consumed when their terminal notification is delivered.
    clients: HashMap<ClientId, mpsc::UnboundedSender<ViewEvent>>,
}

/// Create the supervisor's inbox and spawn its driving task. The inbox is
/// returned immediately: messages sent while the bootstrap metadata query
/// is still running queue up and drain in arrival order afterwards.
pub(crate) fn spawn(view: Arc<View>, router: Router) -> mpsc::Sender<CommandForView> {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    let self_inbox = tx.clone();

    tokio::spawn(async move {
        let (state, stored_version, stored_timestamp) =
            bootstrap(&view, router.shared().registry.as_ref()).await;

        let supervisor = ViewSupervisor {
            view,
            state,
            stored_version,
            stored_timestamp,
            inbox: rx,
            self_inbox,
            router,
            peers: HashMap::new(),
            clients: HashMap::new(),
        };
        supervisor.run().await;
    });

    tx
}

/// Derive the initial state from stored metadata, registering the partition
/// and checking the transformation version on the way. Failures degrade to
/// a from-scratch state rather than keeping the view unreachable.
async fn bootstrap(
    view: &Arc<View>,
    registry: &dyn SchemaRegistry,
) -> (ViewState, Option<String>, i64) {
    if !view.is_external {
        if let Err(err) = registry.add_partition(view).await {
            tracing::warn!(view = %view.path, ?err, "failed to ensure partition at bootstrap");
        }
        match registry.check_version(view).await {
            Ok(VersionCheck::VersionOk) => {}
            Ok(VersionCheck::VersionMismatch { stored, current }) => {
                tracing::info!(
                    view = %view.path,
                    %stored,
                    %current,
                    "transformation version changed; next materialize re-transforms"
                );
            }
            Err(err) => {
                tracing::warn!(view = %view.path, ?err, "version check failed at bootstrap")
            }
        }
    }

    match registry.stored_metadata(view).await {
        Ok(Some(ViewMetadata { version, timestamp })) => (
            ViewState::ReadFromSchemaManager {
                view: view.clone(),
                version: version.clone(),
                last_transformed_at: timestamp,
            },
            Some(version),
            timestamp,
        ),
        Ok(None) => (ViewState::CreatedFromScratch { view: view.clone() }, None, 0),
        Err(err) => {
            tracing::warn!(view = %view.path, ?err, "failed to read stored metadata at bootstrap");
            (ViewState::CreatedFromScratch { view: view.clone() }, None, 0)
        }
    }
}

impl ViewSupervisor {
    // Spans carry the table prefix so one table's partition views can be
    // followed together in the logs.
    #[tracing::instrument(skip_all, fields(view = %self.view.path, table = %self.view.table_name()))]
    async fn run(mut self) {
        tracing::debug!(state = self.state.label(), "view supervisor started");

        while let Some(envelope) = self.inbox.recv().await {
            // The dispatcher permit bounds how many supervisors step
            // concurrently; action dispatch happens outside of it.
            let permit = self
                .router
                .shared()
                .permits
                .clone()
                .acquire_owned()
                .await
                .expect("views dispatcher semaphore closed");

            let CommandForView {
                source, command, ..
            } = envelope;
            let actions = self.handle(source, command).await;
            drop(permit);

            for action in actions {
                self.dispatch(action).await;
            }
        }

        tracing::debug!("view supervisor stopped");
    }

    /// Classify one message, step the state machine, record the transition.
    async fn handle(&mut self, source: Option<ViewPath>, command: ViewCommand) -> Vec<Action> {
        let event = self.classify(source, command);

        // NoOp views have no other readiness signal than their success
        // marker, which is probed before stepping so the machine stays pure.
        let success_flag_exists = if self.view.is_no_op()
            && !self.state.is_in_flight()
            && matches!(event, Event::Materialize { .. })
        {
            match self
                .router
                .shared()
                .executor
                .success_flag_exists(&self.view)
                .await
            {
                Ok(exists) => exists,
                Err(err) => {
                    tracing::warn!(view = %self.view.path, ?err, "success flag probe failed");
                    false
                }
            }
        } else {
            false
        };

        let ctx = StepContext {
            now: Utc::now().timestamp_millis(),
            max_retries: self.router.shared().config.max_retries,
            checksum_matches: self.stored_version.is_some()
                && self.stored_version == self.view.transformation_version,
            stored_timestamp: self.stored_timestamp,
            success_flag_exists,
        };

        let previous = self.state.clone();
        let machine::ResultingState { next, actions } = machine::step(previous.clone(), event, &ctx);
        self.state = next;
        self.after_transition(&previous, &ctx, &actions);
        actions
    }

    fn classify(&mut self, source: Option<ViewPath>, command: ViewCommand) -> Event {
        match command {
            ViewCommand::Materialize { mode, requester } => Event::Materialize {
                mode,
                requester: self.admit(requester),
            },
            ViewCommand::Invalidate { requester } => Event::Invalidate {
                requester: self.admit(requester),
            },
            ViewCommand::ViewMaterialized {
                transformation_timestamp,
                with_errors,
                incomplete,
            } => Event::ViewMaterialized {
                dependency: self.attributed(source),
                transformation_timestamp,
                with_errors,
                incomplete,
            },
            ViewCommand::ViewHasNoData => Event::ViewHasNoData {
                dependency: self.attributed(source),
            },
            ViewCommand::ViewFailed => Event::ViewFailed {
                dependency: self.attributed(source),
            },
            ViewCommand::TransformationSucceeded { has_data } => {
                Event::TransformationSucceeded { has_data }
            }
            ViewCommand::TransformationFailed => Event::TransformationFailed,
            ViewCommand::Retry => Event::Retry,
            ViewCommand::MetadataForMaterialize {
                version,
                timestamp,
                mode,
                requester,
            } => {
                // The store's answer is also the freshest persisted
                // metadata this supervisor knows.
                self.stored_version = Some(version.clone());
                self.stored_timestamp = timestamp;
                Event::MetadataForMaterialize {
                    version,
                    timestamp,
                    mode,
                    requester,
                }
            }
            ViewCommand::MetadataFetchFailed { requester } => {
                Event::MetadataFetchFailed { requester }
            }
        }
    }

    /// Turn a requester into a listener, stashing client reply channels.
    fn admit(&mut self, requester: Requester) -> Listener {
        match requester {
            Requester::View(path) => Listener::View(path),
            Requester::Client { id, reply } => {
                self.clients.insert(id, reply);
                Listener::External(id)
            }
        }
    }

    /// The source view of a dependency report. Reports without one are a
    /// bug in the sender, not a recoverable condition.
    fn attributed(&self, source: Option<ViewPath>) -> ViewPath {
        let Some(source) = source else {
            tracing::error!(view = %self.view.path, "dependency report without a source view");
            panic!("dependency report without a source view");
        };
        source
    }

    fn after_transition(&mut self, previous: &ViewState, ctx: &StepContext, actions: &[Action]) {
        // Leaving for Invalidated drops the persisted metadata this
        // supervisor caches: the next materialize must transform again.
        if matches!(self.state, ViewState::Invalidated { .. })
            && !matches!(previous, ViewState::Invalidated { .. })
        {
            self.stored_version = None;
            self.stored_timestamp = 0;
        }

        // Entering Retrying arms the one-shot backoff timer. Timers are
        // never cancelled; a stale Retry is ignored by the machine.
        if let ViewState::Retrying { retry, .. } = &self.state {
            if !matches!(previous, ViewState::Retrying { .. }) {
                self.arm_retry_timer(*retry);
            }
        }

        // External views don't emit listener-bus events.
        if self.view.is_external {
            return;
        }

        let variant_changed = previous.label() != self.state.label();
        if !variant_changed && actions.is_empty() {
            return;
        }

        let previous = StatusSnapshot::from(previous);
        let next = StatusSnapshot::from(&self.state);

        if variant_changed {
            self.router.shared().bus.publish(BusEvent::StateChanged {
                view: self.view.path.clone(),
                previous: previous.clone(),
                next: next.clone(),
            });
        }
        if !actions.is_empty() {
            self.router.shared().bus.publish(BusEvent::ActionsIssued {
                view: self.view.path.clone(),
                previous,
                next,
                actions: actions.to_vec(),
                timestamp: ctx.now,
            });
        }
    }

    async fn dispatch(&mut self, action: Action) {
        match action {
            Action::Materialize {
                view: dependency,
                mode,
            } => {
                let requester = Requester::View(self.view.path.clone());
                self.route(dependency, ViewCommand::Materialize { mode, requester })
                    .await;
            }
            Action::Transform { .. } => self.submit_transformation(),
            Action::RequestMetadata {
                mode, requester, ..
            } => {
                self.router.shared().adapter.fetch_for_materialize(
                    self.view.clone(),
                    mode,
                    requester,
                    self.self_inbox.clone(),
                );
            }
            Action::WriteTransformationTimestamp { timestamp, .. } => {
                self.stored_timestamp = timestamp;
                let registry = self.router.shared().registry.clone();
                let view = self.view.clone();
                tokio::spawn(async move {
                    if let Err(err) = registry.log_transformation_timestamp(&view, timestamp).await
                    {
                        tracing::warn!(view = %view.path, ?err, "failed to persist transformation timestamp");
                    }
                });
            }
            Action::WriteTransformationChecksum { .. } => {
                self.stored_version = self.view.transformation_version.clone();
                let registry = self.router.shared().registry.clone();
                let view = self.view.clone();
                tokio::spawn(async move {
                    if let Err(err) = registry.set_view_version(&view).await {
                        tracing::warn!(view = %view.path, ?err, "failed to persist transformation checksum");
                    }
                });
            }
            Action::TouchSuccessFlag { .. } => {
                let executor = self.router.shared().executor.clone();
                let view = self.view.clone();
                tokio::spawn(async move {
                    if let Err(err) = executor.touch_success_flag(&view).await {
                        tracing::warn!(view = %view.path, ?err, "failed to touch success flag");
                    }
                });
            }
            Action::ReportMaterialized {
                listeners,
                transformation_timestamp,
                with_errors,
                incomplete,
                ..
            } => {
                let event = ViewEvent::ViewMaterialized {
                    view: self.view.path.clone(),
                    transformation_timestamp,
                    with_errors,
                    incomplete,
                };
                self.report(listeners, event).await;
            }
            Action::ReportNoDataAvailable { listeners, .. } => {
                let event = ViewEvent::ViewHasNoData {
                    view: self.view.path.clone(),
                };
                self.report(listeners, event).await;
            }
            Action::ReportFailed { listeners, .. } => {
                let event = ViewEvent::ViewFailed {
                    view: self.view.path.clone(),
                };
                self.report(listeners, event).await;
            }
            Action::ReportInvalidated { listeners, .. } => {
                let event = ViewEvent::ViewInvalidated {
                    view: self.view.path.clone(),
                };
                self.report(listeners, event).await;
            }
            Action::ReportNotInvalidated { listeners, .. } => {
                let event = ViewEvent::ViewNotInvalidated {
                    view: self.view.path.clone(),
                };
                self.report(listeners, event).await;
            }
        }
    }

    /// Run the transformation on its own task; the executor's outcome (or
    /// error, converted) is posted back onto this supervisor's inbox.
    fn submit_transformation(&self) {
        let executor = self.router.shared().executor.clone();
        let view = self.view.clone();
        let inbox = self.self_inbox.clone();

        tokio::spawn(async move {
            let command = match executor.submit(&view).await {
                Ok(has_data) => ViewCommand::TransformationSucceeded { has_data },
                Err(err) => {
                    tracing::warn!(view = %view.path, ?err, "transformation attempt failed");
                    ViewCommand::TransformationFailed
                }
            };
            let envelope = CommandForView {
                source: None,
                target: view.path.clone(),
                command,
            };
            if inbox.send(envelope).await.is_err() {
                tracing::warn!(view = %view.path, "supervisor inbox closed before transformation outcome");
            }
        });
    }

    fn arm_retry_timer(&self, retry: u32) {
        let delay = self.router.shared().config.retry_backoff(retry);
        let inbox = self.self_inbox.clone();
        let target = self.view.path.clone();
        tracing::debug!(view = %target, retry, ?delay, "arming retry timer");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let envelope = CommandForView {
                source: None,
                target,
                command: ViewCommand::Retry,
            };
            let _ = inbox.send(envelope).await;
        });
    }

    /// Deliver a terminal notification to every listener of the concluded
    /// attempt: client channels directly, dependent views through routing.
    async fn report(&mut self, listeners: Vec<Listener>, event: ViewEvent) {
        for listener in listeners {
            match listener {
                Listener::External(id) => {
                    let Some(reply) = self.clients.remove(&id) else {
                        tracing::warn!(view = %self.view.path, client = %id, "no reply channel for subscriber");
                        continue;
                    };
                    if reply.send(event.clone()).is_err() {
                        tracing::debug!(view = %self.view.path, client = %id, "subscriber went away");
                    }
                }
                Listener::View(path) => {
                    let command = match &event {
                        ViewEvent::ViewMaterialized {
                            transformation_timestamp,
                            with_errors,
                            incomplete,
                            ..
                        } => ViewCommand::ViewMaterialized {
                            transformation_timestamp: *transformation_timestamp,
                            with_errors: *with_errors,
                            incomplete: *incomplete,
                        },
                        ViewEvent::ViewHasNoData { .. } => ViewCommand::ViewHasNoData,
                        ViewEvent::ViewFailed { .. } => ViewCommand::ViewFailed,
                        ViewEvent::ViewInvalidated { .. } | ViewEvent::ViewNotInvalidated { .. } => {
                            // Views enqueue themselves only for materialization.
                            tracing::warn!(view = %self.view.path, listener = %path, "view listener on an invalidate outcome");
                            continue;
                        }
                    };
                    self.route(path, command).await;
                }
            }
        }
    }

    /// Send `command` to the supervisor of `target`, resolving it through
    /// the router on a cache miss and folding the returned inbox reference
    /// into the peer cache.
    async fn route(&mut self, target: ViewPath, command: ViewCommand) {
        let envelope = CommandForView {
            source: Some(self.view.path.clone()),
            target: target.clone(),
            command,
        };

        if let Some(peer) = self.peers.get(&target) {
            if !peer.is_closed() {
                if peer.send(envelope).await.is_err() {
                    tracing::error!(view = %self.view.path, %target, "peer inbox closed mid-send");
                }
                return;
            }
            self.peers.remove(&target);
        }

        match self.router.forward(envelope).await {
            Ok(inbox) => {
                self.peers.insert(target, inbox);
            }
            Err(err) => {
                tracing::error!(view = %self.view.path, %target, ?err, "failed to route command to view");
            }
        }
    }
}
