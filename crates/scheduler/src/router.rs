//! The router: a keyed mapping from view identity to supervisor inbox.
//! Supervisors are created lazily on first reference; messages addressed to
//! a view whose supervisor is still bootstrapping queue in its inbox and
//! drain in arrival order. The map is the only structure shared across
//! supervisors, and its lock is never held across an await.

use crate::gateways::{MetadataAdapter, SchemaRegistry, TransformationExecutor};
use crate::listeners::{BusEvent, ListenerBus};
use crate::supervisor::{self, CommandForView, Requester, ViewCommand, ViewEvent};
use models::{Catalog, ClientId, Config, MaterializeMode, ViewPath};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("unknown view `{0}`")]
    UnknownView(ViewPath),
    #[error("supervisor inbox closed for view `{0}`")]
    InboxClosed(ViewPath),
}

/// Collaborators every supervisor works with, owned by the router.
pub(crate) struct Shared {
    pub(crate) config: Arc<Config>,
    pub(crate) executor: Arc<dyn TransformationExecutor>,
    pub(crate) registry: Arc<dyn SchemaRegistry>,
    pub(crate) adapter: MetadataAdapter,
    pub(crate) bus: ListenerBus,
    /// Bounds how many supervisor inboxes make progress concurrently.
    pub(crate) permits: Arc<Semaphore>,
}

struct RouterInner {
    catalog: Catalog,
    shared: Shared,
    supervisors: Mutex<HashMap<ViewPath, mpsc::Sender<CommandForView>>>,
}

/// Cheap-to-clone handle; supervisors hold one to reach their peers.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(
        catalog: Catalog,
        config: Config,
        executor: Arc<dyn TransformationExecutor>,
        registry: Arc<dyn SchemaRegistry>,
    ) -> Self {
        let config = Arc::new(config);
        let adapter = MetadataAdapter::new(registry.clone(), config.metadata_fetch_timeout());
        let permits = Arc::new(Semaphore::new(config.views_dispatcher_parallelism));

        Self {
            inner: Arc::new(RouterInner {
                catalog,
                shared: Shared {
                    config,
                    executor,
                    registry,
                    adapter,
                    bus: ListenerBus::new(),
                    permits,
                },
                supervisors: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    /// Observe state changes and scheduling actions across all views.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BusEvent> {
        self.inner.shared.bus.subscribe()
    }

    /// Eagerly create a supervisor for every cataloged view. Each derives
    /// its bootstrap state from stored metadata; lazy creation on first
    /// message remains available for anything skipped here.
    pub fn bootstrap(&self) -> Result<(), RouterError> {
        for view in self.inner.catalog.iter() {
            let _ = self.lookup_or_create(&view.path)?;
        }
        tracing::info!(views = self.inner.catalog.len(), "bootstrapped view supervisors");
        Ok(())
    }

    pub fn lookup(&self, view: &ViewPath) -> Option<mpsc::Sender<CommandForView>> {
        self.inner.supervisors.lock().unwrap().get(view).cloned()
    }

    /// The supervisor inbox for `view`, creating the supervisor on first
    /// reference. The inbox is registered under the map lock, so concurrent
    /// callers always agree on one supervisor per view path.
    pub fn lookup_or_create(
        &self,
        view: &ViewPath,
    ) -> Result<mpsc::Sender<CommandForView>, RouterError> {
        let mut supervisors = self.inner.supervisors.lock().unwrap();
        if let Some(inbox) = supervisors.get(view) {
            return Ok(inbox.clone());
        }

        let Some(description) = self.inner.catalog.get(view) else {
            return Err(RouterError::UnknownView(view.clone()));
        };
        tracing::debug!(%view, table = %description.table_name(), "creating view supervisor");
        let inbox = supervisor::spawn(description.clone(), self.clone());
        supervisors.insert(view.clone(), inbox.clone());
        Ok(inbox)
    }

    /// Deliver `envelope` to its target, creating the supervisor when
    /// needed, and return the target's inbox for the caller to fold into
    /// its peer cache.
    pub async fn forward(
        &self,
        envelope: CommandForView,
    ) -> Result<mpsc::Sender<CommandForView>, RouterError> {
        let target = envelope.target.clone();
        let inbox = self.lookup_or_create(&target)?;
        inbox
            .send(envelope)
            .await
            .map_err(|_| RouterError::InboxClosed(target))?;
        Ok(inbox)
    }

    /// Deliver `command` to every live supervisor.
    pub async fn broadcast(&self, command: ViewCommand) {
        let targets: Vec<(ViewPath, mpsc::Sender<CommandForView>)> = {
            let supervisors = self.inner.supervisors.lock().unwrap();
            supervisors
                .iter()
                .map(|(path, inbox)| (path.clone(), inbox.clone()))
                .collect()
        };

        for (target, inbox) in targets {
            let envelope = CommandForView {
                source: None,
                target: target.clone(),
                command: command.clone(),
            };
            if inbox.send(envelope).await.is_err() {
                tracing::warn!(%target, "dropping broadcast for closed supervisor inbox");
            }
        }
    }

    /// Ask `view` to be brought up to date. The returned channel yields the
    /// terminal notification of the attempt this request joins.
    pub async fn materialize(
        &self,
        view: &ViewPath,
        mode: MaterializeMode,
    ) -> Result<mpsc::UnboundedReceiver<ViewEvent>, RouterError> {
        let (reply, notifications) = mpsc::unbounded_channel();
        let requester = Requester::Client {
            id: ClientId::next(),
            reply,
        };
        self.forward(CommandForView {
            source: None,
            target: view.clone(),
            command: ViewCommand::Materialize { mode, requester },
        })
        .await?;
        Ok(notifications)
    }

    /// Ask for `view` to be invalidated. The returned channel yields either
    /// the acknowledgement or the rejection.
    pub async fn invalidate(
        &self,
        view: &ViewPath,
    ) -> Result<mpsc::UnboundedReceiver<ViewEvent>, RouterError> {
        let (reply, notifications) = mpsc::unbounded_channel();
        let requester = Requester::Client {
            id: ClientId::next(),
            reply,
        };
        self.forward(CommandForView {
            source: None,
            target: view.clone(),
            command: ViewCommand::Invalidate { requester },
        })
        .await?;
        Ok(notifications)
    }
}
