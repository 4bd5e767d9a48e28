//! The engine facade.

use std::sync::Arc;

use chrono::Utc;
use ect_config::{
  Compo, EngineConfig, ModuleId, OptionId, RefId, SignatureId, Status, StatusAction, StatusId,
  StatusOption, UserId, WorkflowId,
};
use ect_store::{CaseRecord, NewSignature, StatusTracking, Store, WorkflowLock};
use ect_workflow::StatusGraph;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::actions::ActionRegistry;
use crate::audit::AuditTracker;
use crate::cache::GraphCache;
use crate::context::Actor;
use crate::error::EngineError;
use crate::events::{EngineEvent, EngineNotifier, NoopNotifier};
use crate::locks::{LockInfo, LockManager, OperationClaim};
use crate::rules::Evaluator;

/// The workflow engine.
///
/// Owns the store handle and every component that works against it. Case
/// operations live in `coordinator` and `returns`, definition edits in
/// `admin`.
pub struct Engine {
  pub(crate) store: Arc<dyn Store>,
  pub(crate) cache: GraphCache,
  pub(crate) evaluator: Evaluator,
  pub(crate) actions: ActionRegistry,
  pub(crate) locks: LockManager,
  pub(crate) audit: AuditTracker,
  pub(crate) notifier: Arc<dyn EngineNotifier>,
  definition_lock: Mutex<()>,
}

impl Engine {
  /// Create an engine with the built-in rule, validation and action types.
  pub fn new(store: Arc<dyn Store>, config: &EngineConfig) -> Self {
    Self {
      cache: GraphCache::new(config.cache_graphs),
      evaluator: Evaluator::default(),
      actions: ActionRegistry::standard(),
      locks: LockManager::new(store.clone(), config.stale_lock_after()),
      audit: AuditTracker::new(store.clone()),
      notifier: Arc::new(NoopNotifier),
      definition_lock: Mutex::new(()),
      store,
    }
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn EngineNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn with_evaluator(mut self, evaluator: Evaluator) -> Self {
    self.evaluator = evaluator;
    self
  }

  pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
    self.actions = actions;
    self
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  pub fn locks(&self) -> &LockManager {
    &self.locks
  }

  pub fn audit(&self) -> &AuditTracker {
    &self.audit
  }

  /// The validated graph for a workflow.
  pub async fn graph(&self, workflow_id: WorkflowId) -> Result<Arc<StatusGraph>, EngineError> {
    self.cache.get_or_load(self.store.as_ref(), workflow_id).await
  }

  /// A workflow's statuses in display order.
  pub async fn statuses(&self, workflow_id: WorkflowId) -> Result<Vec<Status>, EngineError> {
    let graph = self.graph(workflow_id).await?;
    Ok(graph.statuses().into_iter().cloned().collect())
  }

  pub async fn initial_status(&self, workflow_id: WorkflowId) -> Result<Status, EngineError> {
    let graph = self.graph(workflow_id).await?;
    Ok(graph.initial_status()?.clone())
  }

  /// Active options out of a status for a component, in display order.
  ///
  /// Without a component the workflow's own component is used.
  pub async fn options_for_status(
    &self,
    workflow_id: WorkflowId,
    status_id: StatusId,
    compo: Option<Compo>,
  ) -> Result<Vec<StatusOption>, EngineError> {
    let graph = self.graph(workflow_id).await?;
    let compo = compo.unwrap_or(graph.workflow().compo);
    Ok(
      graph
        .options_for_status(status_id, compo)?
        .into_iter()
        .cloned()
        .collect(),
    )
  }

  /// Actions attached to an option, in execution order.
  pub async fn actions_for_option(
    &self,
    option_id: OptionId,
  ) -> Result<Vec<StatusAction>, EngineError> {
    let graph = self.graph_for_option(option_id).await?;
    Ok(
      graph
        .actions_for(option_id)?
        .into_iter()
        .cloned()
        .collect(),
    )
  }

  /// Options a case may take from where it is now.
  pub async fn available_options(
    &self,
    ref_id: RefId,
    module: ModuleId,
  ) -> Result<Vec<StatusOption>, EngineError> {
    let case = self.store.get_case(ref_id, module).await?;
    let Some(status_id) = case.status_id else {
      return Ok(Vec::new());
    };
    self
      .options_for_status(case.workflow_id, status_id, None)
      .await
  }

  pub async fn case(&self, ref_id: RefId, module: ModuleId) -> Result<CaseRecord, EngineError> {
    Ok(self.store.get_case(ref_id, module).await?)
  }

  /// Status history for a reference, optionally limited to one module.
  pub async fn history(
    &self,
    ref_id: RefId,
    module: Option<ModuleId>,
  ) -> Result<Vec<StatusTracking>, EngineError> {
    self.audit.history(ref_id, module).await
  }

  /// Record the actor's signature at the case's current status.
  pub async fn add_signature(
    &self,
    ref_id: RefId,
    module: ModuleId,
    actor: &Actor,
    cancel: &CancellationToken,
  ) -> Result<SignatureId, EngineError> {
    if cancel.is_cancelled() {
      return Err(EngineError::Cancelled);
    }

    let claim = self.lock_case(ref_id, module, actor).await?;
    let result = self.sign_locked(ref_id, module, actor, cancel).await;
    self.unlock_case(claim).await;
    result
  }

  async fn sign_locked(
    &self,
    ref_id: RefId,
    module: ModuleId,
    actor: &Actor,
    cancel: &CancellationToken,
  ) -> Result<SignatureId, EngineError> {
    let case = self.store.get_case(ref_id, module).await?;
    let status_id = case.status_id.ok_or_else(|| EngineError::StaleState {
      message: format!("case {} (module {}) is complete", ref_id, module),
    })?;
    if cancel.is_cancelled() {
      return Err(EngineError::Cancelled);
    }

    let signature_id = self
      .store
      .add_signature(&NewSignature {
        ref_id,
        module,
        status_id,
        user_id: actor.user_id,
        name_rank: actor.name_rank(),
        signed_at: Utc::now(),
      })
      .await?;
    info!(
      ref_id = %ref_id,
      module = %module,
      status_id = %status_id,
      user_id = %actor.user_id,
      "signature recorded"
    );
    Ok(signature_id)
  }

  /// Every lock with age and staleness.
  pub async fn list_locks(&self) -> Result<Vec<LockInfo>, EngineError> {
    self.locks.list_all().await
  }

  /// Release the caller's own lock.
  pub async fn release_lock(
    &self,
    ref_id: RefId,
    module: ModuleId,
    user_id: UserId,
  ) -> Result<bool, EngineError> {
    self.locks.release(ref_id, module, user_id).await
  }

  /// Administrative override: remove a lock whoever holds it.
  pub async fn clear_lock(
    &self,
    ref_id: RefId,
    module: ModuleId,
  ) -> Result<Option<WorkflowLock>, EngineError> {
    let cleared = self.locks.force_clear(ref_id, module).await?;
    if let Some(lock) = &cleared {
      self.notifier.notify(EngineEvent::LockCleared {
        ref_id,
        module,
        held_by: lock.user_id,
      });
    }
    Ok(cleared)
  }

  /// Remove locks older than the configured stale threshold.
  pub async fn clear_stale_locks(&self) -> Result<Vec<WorkflowLock>, EngineError> {
    let cleared = self.locks.clear_stale(self.locks.stale_after()).await?;
    for lock in &cleared {
      self.notifier.notify(EngineEvent::LockCleared {
        ref_id: lock.ref_id,
        module: lock.module,
        held_by: lock.user_id,
      });
    }
    Ok(cleared)
  }

  pub(crate) async fn graph_for_option(
    &self,
    option_id: OptionId,
  ) -> Result<Arc<StatusGraph>, EngineError> {
    let option = self.store.find_option(option_id).await?;
    let status = self.store.find_status(option.status_id).await?;
    self.graph(status.workflow_id).await
  }

  /// Take exclusive hold of a case for one operation.
  pub(crate) async fn lock_case(
    &self,
    ref_id: RefId,
    module: ModuleId,
    actor: &Actor,
  ) -> Result<OperationClaim, EngineError> {
    self.locks.begin_operation(ref_id, module, actor).await
  }

  /// End a hold taken by [`Engine::lock_case`]. Locks the actor already held
  /// before the operation stay in place.
  pub(crate) async fn unlock_case(&self, claim: OperationClaim) {
    self.locks.end_operation(claim).await;
  }

  /// Serialize definition edits. Ids are allocated from shared id spaces,
  /// so edits to different workflows are serialized too.
  pub(crate) async fn definition_guard(&self) -> MutexGuard<'_, ()> {
    self.definition_lock.lock().await
  }
}
