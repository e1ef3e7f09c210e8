//! Engine configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tunables of the execution coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Default timeout for external calls; a node's own timeout wins
    pub node_timeout_ms: Option<u64>,
    /// Upper bound on concurrently running external calls
    pub max_parallel_nodes: usize,
    /// Hard cap on loop iteration counts
    pub max_loop_iterations: u32,
    /// Nesting limit when expanding Subflow nodes
    pub max_subflow_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: None,
            max_parallel_nodes: 8,
            max_loop_iterations: 1000,
            max_subflow_depth: 8,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; missing keys take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn with_node_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.node_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_parallel_nodes(mut self, max: usize) -> Self {
        self.max_parallel_nodes = max.max(1);
        self
    }

    pub fn with_max_loop_iterations(mut self, max: u32) -> Self {
        self.max_loop_iterations = max;
        self
    }

    pub fn with_max_subflow_depth(mut self, max: usize) -> Self {
        self.max_subflow_depth = max;
        self
    }

    /// Effective timeout for a node, if any
    pub fn timeout_for(&self, node_timeout_ms: Option<u64>) -> Option<Duration> {
        node_timeout_ms
            .or(self.node_timeout_ms)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"nodeTimeoutMs": 5000, "maxParallelNodes": 2}"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.node_timeout_ms, Some(5000));
        assert_eq!(config.max_parallel_nodes, 2);
        assert_eq!(config.max_loop_iterations, 1000);
        assert_eq!(config.max_subflow_depth, 8);
    }

    #[test]
    fn test_node_timeout_overrides_default() {
        let config = EngineConfig::new().with_node_timeout_ms(100);
        assert_eq!(config.timeout_for(None), Some(Duration::from_millis(100)));
        assert_eq!(config.timeout_for(Some(20)), Some(Duration::from_millis(20)));
        assert_eq!(EngineConfig::default().timeout_for(None), None);
    }

    #[test]
    fn test_parallelism_floor() {
        assert_eq!(EngineConfig::new().with_max_parallel_nodes(0).max_parallel_nodes, 1);
    }
}
