use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// MaterializeMode tunes what a materialization request is allowed to skip.
/// The mode is threaded through the waiting / transforming / retrying states
/// so that one materialization attempt applies it consistently.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaterializeMode {
    /// Materialize dependencies, then transform only if the transformation
    /// checksum changed or a dependency is fresher than the last run.
    #[default]
    Default,
    /// Materialize dependencies and transform unconditionally, ignoring the
    /// stored transformation checksum.
    ResetTransformationChecksums,
    /// Like [`MaterializeMode::ResetTransformationChecksums`], additionally
    /// ignoring the stored transformation timestamp.
    ResetTransformationChecksumsAndTimestamps,
    /// Transform this view only, without touching its dependencies.
    TransformOnly,
    /// Do not transform at all: persist the current checksum and timestamp
    /// and report the view as materialized.
    SetOnly,
}

impl MaterializeMode {
    /// Whether this mode materializes the view's dependencies first.
    pub fn fans_out(&self) -> bool {
        matches!(
            self,
            MaterializeMode::Default
                | MaterializeMode::ResetTransformationChecksums
                | MaterializeMode::ResetTransformationChecksumsAndTimestamps
        )
    }
}
