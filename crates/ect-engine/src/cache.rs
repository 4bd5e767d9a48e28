//! Validated graph caching.
//!
//! Graphs are built once per workflow and shared. Definition edits invalidate
//! the entry so the next reader rebuilds from the store.

use std::collections::HashMap;
use std::sync::Arc;

use ect_config::WorkflowId;
use ect_store::Store;
use ect_workflow::StatusGraph;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::EngineError;

#[derive(Default)]
struct Entries {
  graphs: HashMap<WorkflowId, Arc<StatusGraph>>,
  /// Bumped by every invalidation. A load that started before the bump is
  /// returned to its caller but not cached.
  generation: u64,
}

/// Caches validated status graphs by workflow.
#[derive(Clone)]
pub struct GraphCache {
  entries: Arc<RwLock<Entries>>,
  enabled: bool,
}

impl GraphCache {
  pub fn new(enabled: bool) -> Self {
    Self {
      entries: Arc::new(RwLock::new(Entries::default())),
      enabled,
    }
  }

  /// Get a graph from cache, or load, validate and cache it.
  pub async fn get_or_load(
    &self,
    store: &dyn Store,
    workflow_id: WorkflowId,
  ) -> Result<Arc<StatusGraph>, EngineError> {
    let (cached, seen) = self.lookup(workflow_id).await;
    if let Some(graph) = cached {
      return Ok(graph);
    }

    let definition = store.load_definition(workflow_id).await?;
    let graph = Arc::new(StatusGraph::build(definition)?);
    debug!(workflow_id = %workflow_id, "status graph loaded");

    self.insert_if_current(workflow_id, graph.clone(), seen).await;
    Ok(graph)
  }

  async fn lookup(&self, workflow_id: WorkflowId) -> (Option<Arc<StatusGraph>>, u64) {
    let entries = self.entries.read().await;
    let cached = if self.enabled {
      entries.graphs.get(&workflow_id).cloned()
    } else {
      None
    };
    (cached, entries.generation)
  }

  async fn insert_if_current(
    &self,
    workflow_id: WorkflowId,
    graph: Arc<StatusGraph>,
    seen: u64,
  ) -> bool {
    if !self.enabled {
      return false;
    }
    let mut entries = self.entries.write().await;
    if entries.generation != seen {
      debug!(workflow_id = %workflow_id, "definition changed during load, not caching");
      return false;
    }
    entries.graphs.insert(workflow_id, graph);
    true
  }

  /// Drop a workflow's cached graph.
  pub async fn invalidate(&self, workflow_id: WorkflowId) {
    let mut entries = self.entries.write().await;
    entries.generation += 1;
    entries.graphs.remove(&workflow_id);
  }

  /// Clear the cache.
  pub async fn clear(&self) {
    let mut entries = self.entries.write().await;
    entries.generation += 1;
    entries.graphs.clear();
  }
}

impl Default for GraphCache {
  fn default() -> Self {
    Self::new(true)
  }
}
