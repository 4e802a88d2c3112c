use async_trait::async_trait;
use models::{Catalog, Config, View, ViewPath};
use scheduler::gateways::success_flag_path;
use scheduler::{
    BusEvent, Router, SchemaRegistry, TransformationExecutor, VersionCheck, ViewEvent,
    ViewMetadata,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Scripted transformation executor. Each submission pops the next scripted
/// outcome for the view (`Ok(has_data)` or `Err(())` for a failure) and
/// falls back to `Ok(true)`. A gated view's submission blocks until the
/// test releases it. `_SUCCESS` markers live in a flat in-memory filesystem
/// keyed by [`success_flag_path`], like a real filesystem driver's would.
#[derive(Default)]
pub struct MockExecutor {
    scripts: Mutex<HashMap<ViewPath, VecDeque<Result<bool, ()>>>>,
    success_flags: Mutex<BTreeSet<String>>,
    gates: Mutex<HashMap<ViewPath, Arc<Notify>>>,
    pub submissions: Mutex<Vec<ViewPath>>,
    in_flight: AtomicI64,
    pub max_in_flight: AtomicI64,
}

impl MockExecutor {
    pub fn script(&self, view: &str, outcomes: impl IntoIterator<Item = Result<bool, ()>>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(ViewPath::new(view))
            .or_default()
            .extend(outcomes);
    }

    pub fn set_success_flag(&self, view: &str) {
        self.success_flags
            .lock()
            .unwrap()
            .insert(success_flag_path(&ViewPath::new(view)));
    }

    /// Make submissions for `view` block until the returned handle is
    /// notified.
    pub fn gate(&self, view: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(ViewPath::new(view), gate.clone());
        gate
    }

    pub fn has_success_flag(&self, view: &str) -> bool {
        self.success_flags
            .lock()
            .unwrap()
            .contains(&success_flag_path(&ViewPath::new(view)))
    }

    pub fn submission_count(&self, view: &str) -> usize {
        let view = ViewPath::new(view);
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .filter(|submitted| **submitted == view)
            .count()
    }
}

#[async_trait]
impl TransformationExecutor for MockExecutor {
    async fn submit(&self, view: &View) -> anyhow::Result<bool> {
        self.submissions.lock().unwrap().push(view.path.clone());
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let gate = self.gates.lock().unwrap().get(&view.path).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&view.path)
            .and_then(|script| script.pop_front())
            .unwrap_or(Ok(true));

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Ok(has_data) => Ok(has_data),
            Err(()) => anyhow::bail!("scripted transformation failure"),
        }
    }

    async fn touch_success_flag(&self, view: &View) -> anyhow::Result<()> {
        self.success_flags
            .lock()
            .unwrap()
            .insert(success_flag_path(&view.path));
        Ok(())
    }

    async fn success_flag_exists(&self, view: &View) -> anyhow::Result<bool> {
        Ok(self
            .success_flags
            .lock()
            .unwrap()
            .contains(&success_flag_path(&view.path)))
    }
}

/// In-memory schema registry recording every write.
#[derive(Default)]
pub struct MockRegistry {
    stored: Mutex<HashMap<ViewPath, ViewMetadata>>,
    external: Mutex<HashMap<ViewPath, ViewMetadata>>,
    external_errors: Mutex<BTreeSet<ViewPath>>,
    external_delay: Mutex<Option<Duration>>,
    bootstrap_delay: Mutex<Option<Duration>>,
    pub written_timestamps: Mutex<Vec<(ViewPath, i64)>>,
    pub written_versions: Mutex<Vec<ViewPath>>,
    pub partitions_added: Mutex<Vec<ViewPath>>,
}

impl MockRegistry {
    pub fn set_stored(&self, view: &str, version: &str, timestamp: i64) {
        self.stored.lock().unwrap().insert(
            ViewPath::new(view),
            ViewMetadata {
                version: version.to_string(),
                timestamp,
            },
        );
    }

    pub fn set_external(&self, view: &str, version: &str, timestamp: i64) {
        self.external.lock().unwrap().insert(
            ViewPath::new(view),
            ViewMetadata {
                version: version.to_string(),
                timestamp,
            },
        );
    }

    pub fn fail_external(&self, view: &str) {
        self.external_errors
            .lock()
            .unwrap()
            .insert(ViewPath::new(view));
    }

    pub fn set_external_delay(&self, delay: Duration) {
        *self.external_delay.lock().unwrap() = Some(delay);
    }

    /// Delay every `stored_metadata` answer, keeping supervisors in their
    /// bootstrap for that long.
    pub fn set_bootstrap_delay(&self, delay: Duration) {
        *self.bootstrap_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl SchemaRegistry for MockRegistry {
    async fn stored_metadata(&self, view: &View) -> anyhow::Result<Option<ViewMetadata>> {
        let delay = *self.bootstrap_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.stored.lock().unwrap().get(&view.path).cloned())
    }

    async fn metadata_for_materialize(&self, view: &View) -> anyhow::Result<ViewMetadata> {
        let delay = *self.external_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.external_errors.lock().unwrap().contains(&view.path) {
            anyhow::bail!("scripted metadata failure");
        }
        self.external
            .lock()
            .unwrap()
            .get(&view.path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no metadata for {}", view.path))
    }

    async fn log_transformation_timestamp(
        &self,
        view: &View,
        timestamp: i64,
    ) -> anyhow::Result<()> {
        self.written_timestamps
            .lock()
            .unwrap()
            .push((view.path.clone(), timestamp));
        let mut stored = self.stored.lock().unwrap();
        let entry = stored.entry(view.path.clone()).or_insert(ViewMetadata {
            version: String::new(),
            timestamp: 0,
        });
        entry.timestamp = timestamp;
        Ok(())
    }

    async fn set_view_version(&self, view: &View) -> anyhow::Result<()> {
        self.written_versions.lock().unwrap().push(view.path.clone());
        if let Some(version) = &view.transformation_version {
            let mut stored = self.stored.lock().unwrap();
            let entry = stored.entry(view.path.clone()).or_insert(ViewMetadata {
                version: String::new(),
                timestamp: 0,
            });
            entry.version = version.clone();
        }
        Ok(())
    }

    async fn add_partition(&self, view: &View) -> anyhow::Result<()> {
        self.partitions_added.lock().unwrap().push(view.path.clone());
        Ok(())
    }

    async fn check_version(&self, view: &View) -> anyhow::Result<VersionCheck> {
        let stored = self.stored.lock().unwrap().get(&view.path).cloned();
        Ok(match (stored, &view.transformation_version) {
            (Some(stored), Some(current)) if stored.version != *current => {
                VersionCheck::VersionMismatch {
                    stored: stored.version,
                    current: current.clone(),
                }
            }
            _ => VersionCheck::VersionOk,
        })
    }
}

pub struct Harness {
    pub router: Router,
    pub executor: Arc<MockExecutor>,
    pub registry: Arc<MockRegistry>,
}

pub fn harness(views: Vec<View>, config: Config) -> Harness {
    init_logging();
    let executor = Arc::new(MockExecutor::default());
    let registry = Arc::new(MockRegistry::default());
    let router = Router::new(
        Catalog::new(views),
        config,
        executor.clone(),
        registry.clone(),
    );
    Harness {
        router,
        executor,
        registry,
    }
}

pub fn view(path: &str, deps: &[&str], version: Option<&str>) -> View {
    View {
        path: ViewPath::new(path),
        dependencies: deps.iter().map(|dep| ViewPath::new(*dep)).collect(),
        is_external: false,
        transformation_version: version.map(str::to_string),
    }
}

pub fn external(path: &str) -> View {
    View {
        path: ViewPath::new(path),
        dependencies: Vec::new(),
        is_external: true,
        transformation_version: None,
    }
}

/// Next notification, bounded so a wedged scenario fails instead of hanging.
pub async fn recv(notifications: &mut mpsc::UnboundedReceiver<ViewEvent>) -> ViewEvent {
    tokio::time::timeout(Duration::from_secs(300), notifications.recv())
        .await
        .expect("timed out waiting for a view event")
        .expect("notification channel closed")
}

/// Next state-variant transition on the bus, skipping action events.
pub async fn next_state_change(bus: &mut mpsc::UnboundedReceiver<BusEvent>) -> (String, String) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(300), bus.recv())
            .await
            .expect("timed out waiting for a bus event")
            .expect("bus channel closed");
        if let BusEvent::StateChanged { previous, next, .. } = event {
            return (previous.label, next.label);
        }
    }
}

/// Poll until `condition` holds, letting background tasks run.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("never reached: {what}");
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
