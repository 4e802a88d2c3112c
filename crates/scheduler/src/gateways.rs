//! Gateway traits for the collaborators the scheduling core talks to but
//! does not implement: the transformation executors and the metadata store.
//! Everything crossing these seams is converted into typed messages; the
//! core never observes a raised error from a collaborator.

use crate::supervisor::{CommandForView, ViewCommand};
use async_trait::async_trait;
use models::{Listener, MaterializeMode, View, ViewPath};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Stored version and transformation timestamp of a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMetadata {
    pub version: String,
    pub timestamp: i64,
}

/// Outcome of a bootstrap version check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    VersionOk,
    VersionMismatch { stored: String, current: String },
}

/// The transformation executor drivers (Hive, MapReduce, Shell, filesystem).
///
/// `submit` runs the view's transformation to completion and reports whether
/// it produced data. The supervisor runs it on a spawned task and posts the
/// outcome back onto its own inbox, so executor latency never blocks event
/// processing.
#[async_trait]
pub trait TransformationExecutor: Send + Sync {
    async fn submit(&self, view: &View) -> anyhow::Result<bool>;

    /// Create the zero-byte `_SUCCESS` marker in the view's output directory.
    async fn touch_success_flag(&self, view: &View) -> anyhow::Result<()>;

    /// Whether the `_SUCCESS` marker exists; the readiness probe for NoOp
    /// views.
    async fn success_flag_exists(&self, view: &View) -> anyhow::Result<bool>;
}

/// The schema manager / metadata store.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Stored metadata of the view, or None for one never transformed.
    /// Queried once per supervisor at bootstrap.
    async fn stored_metadata(&self, view: &View) -> anyhow::Result<Option<ViewMetadata>>;

    /// Version and timestamp under which an external view currently stands.
    async fn metadata_for_materialize(&self, view: &View) -> anyhow::Result<ViewMetadata>;

    async fn log_transformation_timestamp(&self, view: &View, timestamp: i64)
        -> anyhow::Result<()>;

    /// Persist the view's current transformation code checksum.
    async fn set_view_version(&self, view: &View) -> anyhow::Result<()>;

    /// Ensure the view's partition exists in the metastore.
    async fn add_partition(&self, view: &View) -> anyhow::Result<()>;

    /// Compare the stored transformation checksum against the current one.
    async fn check_version(&self, view: &View) -> anyhow::Result<VersionCheck>;
}

/// MetadataAdapter wraps the registry for the supervisor's use with external
/// views: a lookup is bounded by the configured timeout, and both errors and
/// timeouts come back as a typed `MetadataFetchFailed` so the state machine
/// stays live.
#[derive(Clone)]
pub struct MetadataAdapter {
    registry: Arc<dyn SchemaRegistry>,
    timeout: Duration,
}

impl MetadataAdapter {
    pub fn new(registry: Arc<dyn SchemaRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Resolve metadata for `view` and post the outcome to `inbox`.
    pub fn fetch_for_materialize(
        &self,
        view: Arc<View>,
        mode: MaterializeMode,
        requester: Listener,
        inbox: mpsc::Sender<CommandForView>,
    ) {
        let registry = self.registry.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            let command =
                match tokio::time::timeout(timeout, registry.metadata_for_materialize(&view)).await
                {
                    Ok(Ok(metadata)) => ViewCommand::MetadataForMaterialize {
                        version: metadata.version,
                        timestamp: metadata.timestamp,
                        mode,
                        requester,
                    },
                    Ok(Err(err)) => {
                        tracing::warn!(view = %view.path, ?err, "metadata lookup failed");
                        ViewCommand::MetadataFetchFailed { requester }
                    }
                    Err(_elapsed) => {
                        tracing::warn!(view = %view.path, "metadata lookup timed out");
                        ViewCommand::MetadataFetchFailed { requester }
                    }
                };

            let envelope = CommandForView {
                source: None,
                target: view.path.clone(),
                command,
            };
            if inbox.send(envelope).await.is_err() {
                tracing::warn!(view = %view.path, "supervisor inbox closed before metadata arrived");
            }
        });
    }
}

/// Conventional location of the `_SUCCESS` marker beneath a view's output
/// path, for executor implementations to agree on.
pub fn success_flag_path(view: &ViewPath) -> String {
    [view.as_str(), "/_SUCCESS"].concat()
}
