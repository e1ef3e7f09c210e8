//! Reusable sub-graph definitions and their storage
//!
//! A subflow definition captures an inner graph whose boundary is marked by
//! `SubflowInput` / `SubflowOutput` nodes, together with the ordered port
//! lists a wrapper node exposes to its parent graph.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::composer::CompositionError;
use crate::error::{EngineError, Result};
use crate::types::{GraphNode, NodeId, NodeKind, SubflowId, WorkflowGraph, GRAPH_FORMAT_VERSION};

/// A port of a subflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubflowPort {
    /// ID of the boundary marker node inside the inner graph
    pub id: NodeId,
    /// Display name shown on the wrapper
    pub name: String,
    /// Port position on the wrapper
    pub index: usize,
    /// Inner clone of a Variable/Accumulator source captured at extraction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding_clone: Option<NodeId>,
}

/// A reusable sub-graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubflowDefinition {
    /// Empty until the definition is persisted
    #[serde(default)]
    pub id: SubflowId,
    pub title: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub inputs: Vec<SubflowPort>,
    #[serde(default)]
    pub outputs: Vec<SubflowPort>,
    pub graph: WorkflowGraph,
}

fn default_version() -> String {
    GRAPH_FORMAT_VERSION.to_string()
}

impl SubflowDefinition {
    /// Create an unsaved definition around an inner graph
    pub fn new(title: impl Into<String>, graph: WorkflowGraph) -> Self {
        Self {
            id: String::new(),
            title: title.into(),
            version: default_version(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            graph,
        }
    }

    /// Whether the definition has been persisted
    pub fn is_persisted(&self) -> bool {
        !self.id.is_empty()
    }

    /// Input port with the given index
    pub fn input(&self, index: usize) -> Option<&SubflowPort> {
        self.inputs.iter().find(|p| p.index == index)
    }

    /// Output port with the given index
    pub fn output(&self, index: usize) -> Option<&SubflowPort> {
        self.outputs.iter().find(|p| p.index == index)
    }

    /// Whether any inner wrapper references `id`
    pub fn references(&self, id: &str) -> bool {
        self.graph.nodes.iter().any(|n| match &n.kind {
            NodeKind::Subflow(config) => {
                config.subflow_id.as_deref() == Some(id)
                    || config.pending.as_ref().map_or(false, |p| p.references(id))
            }
            _ => false,
        })
    }
}

/// Summary of a stored definition (for listing)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubflowMetadata {
    pub id: SubflowId,
    pub title: String,
    pub version: String,
    pub input_count: usize,
    pub output_count: usize,
    pub node_count: usize,
}

impl From<&SubflowDefinition> for SubflowMetadata {
    fn from(def: &SubflowDefinition) -> Self {
        Self {
            id: def.id.clone(),
            title: def.title.clone(),
            version: def.version.clone(),
            input_count: def.inputs.len(),
            output_count: def.outputs.len(),
            node_count: def.graph.nodes.len(),
        }
    }
}

/// Storage of subflow definitions
pub trait SubflowRepository: Send + Sync {
    /// Store a definition, assigning an ID when it has none
    fn create_subflow(&mut self, definition: SubflowDefinition) -> Result<SubflowId>;

    /// Look up a definition by ID
    fn get_subflow(&self, id: &str) -> Option<SubflowDefinition>;

    /// List stored definitions
    fn list(&self) -> Vec<SubflowMetadata>;
}

/// In-memory subflow store with optional file persistence
///
/// Each definition is written as `{id}.json` inside the persistence
/// directory.
///
/// # Example
///
/// ```ignore
/// let mut store = SubflowStore::with_persistence(".workflows/subflows");
/// store.load_from_disk()?;
/// let id = store.create_subflow(definition)?;
/// ```
#[derive(Debug, Default)]
pub struct SubflowStore {
    definitions: HashMap<SubflowId, SubflowDefinition>,
    persist_path: Option<PathBuf>,
}

impl SubflowStore {
    /// Create an in-memory store without persistence
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that persists to the given directory
    ///
    /// The directory is created on first save.
    pub fn with_persistence(path: impl AsRef<Path>) -> Self {
        Self {
            definitions: HashMap::new(),
            persist_path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// Load every definition from the persistence directory
    ///
    /// Returns the number of definitions loaded.
    pub fn load_from_disk(&mut self) -> Result<usize> {
        let Some(ref path) = self.persist_path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }

        let mut count = 0;
        for entry in std::fs::read_dir(path)? {
            let file_path = entry?.path();
            if file_path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            let content = std::fs::read_to_string(&file_path)?;
            match serde_json::from_str::<SubflowDefinition>(&content) {
                Ok(def) if def.is_persisted() => {
                    log::info!("Loaded subflow '{}' from {:?}", def.id, file_path);
                    self.definitions.insert(def.id.clone(), def);
                    count += 1;
                }
                Ok(_) => log::warn!("Skipping subflow without an id in {:?}", file_path),
                Err(e) => log::warn!("Failed to parse subflow from {:?}: {}", file_path, e),
            }
        }
        Ok(count)
    }

    fn save_to_disk(&self, def: &SubflowDefinition) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        std::fs::create_dir_all(path)?;
        let file_path = path.join(format!("{}.json", def.id));
        std::fs::write(&file_path, serde_json::to_string_pretty(def)?)?;
        log::debug!("Saved subflow '{}' to {:?}", def.id, file_path);
        Ok(())
    }

    fn delete_from_disk(&self, id: &str) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        let file_path = path.join(format!("{}.json", id));
        if file_path.exists() {
            std::fs::remove_file(&file_path)?;
            log::debug!("Deleted subflow '{}' from {:?}", id, file_path);
        }
        Ok(())
    }

    /// Borrow a definition by ID
    pub fn get(&self, id: &str) -> Option<&SubflowDefinition> {
        self.definitions.get(id)
    }

    /// Remove a definition
    pub fn remove(&mut self, id: &str) -> Result<Option<SubflowDefinition>> {
        self.delete_from_disk(id)?;
        Ok(self.definitions.remove(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.definitions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl SubflowRepository for SubflowStore {
    fn create_subflow(&mut self, mut definition: SubflowDefinition) -> Result<SubflowId> {
        if !definition.is_persisted() {
            definition.id = uuid::Uuid::new_v4().to_string();
        }
        if definition.references(&definition.id) {
            return Err(CompositionError::SelfReference(definition.id).into());
        }
        self.save_to_disk(&definition)?;
        let id = definition.id.clone();
        self.definitions.insert(id.clone(), definition);
        Ok(id)
    }

    fn get_subflow(&self, id: &str) -> Option<SubflowDefinition> {
        self.definitions.get(id).cloned()
    }

    fn list(&self) -> Vec<SubflowMetadata> {
        let mut list: Vec<SubflowMetadata> = self.definitions.values().map(SubflowMetadata::from).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}

/// Resolve the definition a wrapper node refers to
///
/// A pending (unsaved) definition takes precedence over a stored one.
pub fn resolve_definition(
    node: &GraphNode,
    repository: Option<&dyn SubflowRepository>,
) -> Result<SubflowDefinition> {
    let NodeKind::Subflow(config) = &node.kind else {
        return Err(CompositionError::NotAWrapper(node.id.clone()).into());
    };
    if let Some(pending) = &config.pending {
        return Ok(pending.as_ref().clone());
    }
    let id = config
        .subflow_id
        .as_deref()
        .ok_or_else(|| CompositionError::UnresolvedDefinition(node.id.clone()))?;
    repository
        .and_then(|repo| repo.get_subflow(id))
        .ok_or_else(|| EngineError::SubflowNotFound(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WorkflowBuilder;
    use crate::types::SubflowNodeConfig;
    use tempfile::TempDir;

    fn definition(title: &str) -> SubflowDefinition {
        let graph = WorkflowBuilder::new()
            .add_text("t1", "hello")
            .add_preview("p1")
            .connect("t1", "p1")
            .build();
        SubflowDefinition::new(title, graph)
    }

    #[test]
    fn test_create_assigns_id() {
        let mut store = SubflowStore::new();
        let id = store.create_subflow(definition("Greeting")).unwrap();

        assert!(!id.is_empty());
        let stored = store.get_subflow(&id).unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.title, "Greeting");
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.list()[0].node_count, 2);
    }

    #[test]
    fn test_self_reference_rejected() {
        let mut store = SubflowStore::new();
        let mut def = definition("Loop");
        def.id = "self".to_string();
        def.graph.nodes.push(GraphNode::new(
            "w",
            NodeKind::Subflow(SubflowNodeConfig {
                subflow_id: Some("self".to_string()),
                ..Default::default()
            }),
            (0.0, 0.0),
        ));

        let err = store.create_subflow(def).unwrap_err();
        assert!(matches!(err, EngineError::Composition(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let id = {
            let mut store = SubflowStore::with_persistence(dir.path());
            store.create_subflow(definition("Saved")).unwrap()
        };

        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let mut reloaded = SubflowStore::with_persistence(dir.path());
        assert_eq!(reloaded.load_from_disk().unwrap(), 1);
        assert_eq!(reloaded.get(&id).unwrap().title, "Saved");

        reloaded.remove(&id).unwrap();
        assert!(!dir.path().join(format!("{}.json", id)).exists());
    }

    #[test]
    fn test_resolve_prefers_pending() {
        let mut store = SubflowStore::new();
        let id = store.create_subflow(definition("Stored")).unwrap();

        let wrapper = |config: SubflowNodeConfig| GraphNode::new("w", NodeKind::Subflow(config), (0.0, 0.0));

        let stored_ref = wrapper(SubflowNodeConfig {
            subflow_id: Some(id),
            ..Default::default()
        });
        assert_eq!(resolve_definition(&stored_ref, Some(&store)).unwrap().title, "Stored");

        let pending = wrapper(SubflowNodeConfig {
            pending: Some(Box::new(definition("Pending"))),
            ..Default::default()
        });
        assert_eq!(resolve_definition(&pending, None).unwrap().title, "Pending");

        let missing = wrapper(SubflowNodeConfig {
            subflow_id: Some("nope".to_string()),
            ..Default::default()
        });
        assert!(matches!(
            resolve_definition(&missing, Some(&store)),
            Err(EngineError::SubflowNotFound(id)) if id == "nope"
        ));

        let unsaved = wrapper(SubflowNodeConfig::default());
        assert!(matches!(
            resolve_definition(&unsaved, Some(&store)),
            Err(EngineError::Composition(CompositionError::UnresolvedDefinition(_)))
        ));
    }
}
