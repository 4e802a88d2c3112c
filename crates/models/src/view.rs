use crate::{TableName, ViewPath};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// View describes one partitioned, derived dataset as the scheduling core
/// needs to see it: its identity, the views its transformation reads from,
/// and the fingerprint of its current transformation code.
///
/// How views are discovered and parsed is not this crate's concern; a
/// [`Catalog`] of them is supplied at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct View {
    pub path: ViewPath,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ViewPath>,
    /// External views are produced outside this system and are never
    /// transformed; their state is inferred from stored metadata.
    #[serde(default)]
    pub is_external: bool,
    /// Checksum of the view's current transformation code, or None for a
    /// NoOp view without transformation logic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation_version: Option<String>,
}

impl View {
    pub fn new(path: ViewPath) -> Self {
        Self {
            path,
            dependencies: Vec::new(),
            is_external: false,
            transformation_version: None,
        }
    }

    pub fn table_name(&self) -> TableName {
        self.path.table_name()
    }

    /// A NoOp view has no dependencies and no transformation logic: its
    /// readiness is probed through its `_SUCCESS` marker alone.
    pub fn is_no_op(&self) -> bool {
        !self.is_external && self.dependencies.is_empty() && self.transformation_version.is_none()
    }
}

/// Catalog is the supplied view graph, keyed by view path.
#[derive(Debug, Clone, Default)]
pub struct Catalog(BTreeMap<ViewPath, Arc<View>>);

impl Catalog {
    pub fn new(views: impl IntoIterator<Item = View>) -> Self {
        Self(
            views
                .into_iter()
                .map(|view| (view.path.clone(), Arc::new(view)))
                .collect(),
        )
    }

    pub fn get(&self, path: &ViewPath) -> Option<&Arc<View>> {
        self.0.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<View>> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
