use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use ect_config::{
  Compo, ModuleId, OptionId, RefId, SignatureId, Status, StatusAction, StatusId, StatusOption,
  StatusRule, StatusValidation, UserId, Workflow, WorkflowDefinition, WorkflowId,
};
use ect_engine::{
  Actor, Engine, EngineError, LockInfo, NewAction, NewOption, NewRule, NewStatus, NewValidation,
  ReturnOutcome, ReturnRequest, StartCaseRequest, StartOutcome, TransitionOutcome,
  TransitionRequest,
};
use ect_store::{CaseRecord, WorkflowLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ServiceError;
use crate::views::{StepView, WorkstatusView};

/// The request/response surface over an [`Engine`].
///
/// Every call takes a cancellation token. Queries stop as soon as the token
/// fires; mutations hand it to the engine, which honours it up to the commit
/// and ignores it afterwards.
#[derive(Clone)]
pub struct WorkflowService {
  engine: Arc<Engine>,
}

impl WorkflowService {
  pub fn new(engine: Arc<Engine>) -> Self {
    Self { engine }
  }

  pub fn engine(&self) -> &Arc<Engine> {
    &self.engine
  }

  async fn read<T, F>(&self, cancel: &CancellationToken, query: F) -> Result<T, ServiceError>
  where
    F: Future<Output = Result<T, EngineError>>,
  {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ServiceError::cancelled()),
        result = query => result.map_err(ServiceError::from),
    }
  }

  fn ensure_live(cancel: &CancellationToken) -> Result<(), ServiceError> {
    if cancel.is_cancelled() {
      return Err(ServiceError::cancelled());
    }
    Ok(())
  }

  // Queries

  /// Every option of a workflow, grouped by status in display order.
  pub async fn get_steps_by_workflow(
    &self,
    workflow_id: WorkflowId,
    cancel: &CancellationToken,
  ) -> Result<Vec<StepView>, ServiceError> {
    self.read(cancel, self.steps(workflow_id)).await
  }

  /// Options offered at a status, for a component or the workflow's own.
  pub async fn get_steps_by_workflow_and_status(
    &self,
    workflow_id: WorkflowId,
    status_id: StatusId,
    compo: Option<Compo>,
    cancel: &CancellationToken,
  ) -> Result<Vec<StepView>, ServiceError> {
    self
      .read(cancel, self.steps_for_status(workflow_id, status_id, compo))
      .await
  }

  pub async fn get_actions_by_step(
    &self,
    option_id: OptionId,
    cancel: &CancellationToken,
  ) -> Result<Vec<StatusAction>, ServiceError> {
    self
      .read(cancel, self.engine.actions_for_option(option_id))
      .await
  }

  /// Status history of a reference across every module.
  pub async fn get_workstatuses_by_ref_id(
    &self,
    ref_id: RefId,
    cancel: &CancellationToken,
  ) -> Result<Vec<WorkstatusView>, ServiceError> {
    self.read(cancel, self.workstatuses(ref_id, None)).await
  }

  /// Status history of a reference in one module.
  pub async fn get_workstatuses_by_ref_id_and_type(
    &self,
    ref_id: RefId,
    module: ModuleId,
    cancel: &CancellationToken,
  ) -> Result<Vec<WorkstatusView>, ServiceError> {
    self
      .read(cancel, self.workstatuses(ref_id, Some(module)))
      .await
  }

  pub async fn get_all_locks(
    &self,
    cancel: &CancellationToken,
  ) -> Result<Vec<LockInfo>, ServiceError> {
    self.read(cancel, self.engine.list_locks()).await
  }

  pub async fn get_case(
    &self,
    ref_id: RefId,
    module: ModuleId,
    cancel: &CancellationToken,
  ) -> Result<CaseRecord, ServiceError> {
    self.read(cancel, self.engine.case(ref_id, module)).await
  }

  /// Options the case may take from its current status.
  pub async fn get_available_steps(
    &self,
    ref_id: RefId,
    module: ModuleId,
    cancel: &CancellationToken,
  ) -> Result<Vec<StepView>, ServiceError> {
    self.read(cancel, self.available_steps(ref_id, module)).await
  }

  // Case operations

  pub async fn start_case(
    &self,
    request: &StartCaseRequest,
    cancel: &CancellationToken,
  ) -> Result<StartOutcome, ServiceError> {
    Ok(self.engine.start_case(request, cancel).await?)
  }

  pub async fn transition(
    &self,
    request: &TransitionRequest,
    cancel: &CancellationToken,
  ) -> Result<TransitionOutcome, ServiceError> {
    Ok(self.engine.transition(request, cancel).await?)
  }

  pub async fn return_case(
    &self,
    request: &ReturnRequest,
    cancel: &CancellationToken,
  ) -> Result<ReturnOutcome, ServiceError> {
    Ok(self.engine.return_case(request, cancel).await?)
  }

  pub async fn add_signature(
    &self,
    ref_id: RefId,
    module: ModuleId,
    actor: &Actor,
    cancel: &CancellationToken,
  ) -> Result<SignatureId, ServiceError> {
    Ok(
      self
        .engine
        .add_signature(ref_id, module, actor, cancel)
        .await?,
    )
  }

  // Locks

  pub async fn release_lock(
    &self,
    ref_id: RefId,
    module: ModuleId,
    user_id: UserId,
    cancel: &CancellationToken,
  ) -> Result<bool, ServiceError> {
    Self::ensure_live(cancel)?;
    Ok(self.engine.release_lock(ref_id, module, user_id).await?)
  }

  pub async fn clear_lock(
    &self,
    ref_id: RefId,
    module: ModuleId,
    cancel: &CancellationToken,
  ) -> Result<Option<WorkflowLock>, ServiceError> {
    Self::ensure_live(cancel)?;
    Ok(self.engine.clear_lock(ref_id, module).await?)
  }

  pub async fn clear_stale_locks(
    &self,
    cancel: &CancellationToken,
  ) -> Result<Vec<WorkflowLock>, ServiceError> {
    Self::ensure_live(cancel)?;
    Ok(self.engine.clear_stale_locks().await?)
  }

  // Definition edits

  pub async fn create_workflow(
    &self,
    workflow: Workflow,
    cancel: &CancellationToken,
  ) -> Result<Workflow, ServiceError> {
    Ok(self.engine.create_workflow(workflow, cancel).await?)
  }

  pub async fn import_definition(
    &self,
    definition: WorkflowDefinition,
    cancel: &CancellationToken,
  ) -> Result<WorkflowDefinition, ServiceError> {
    let graph = self.engine.import_definition(definition, cancel).await?;
    Ok(graph.to_definition())
  }

  pub async fn insert_workstatus(
    &self,
    status: NewStatus,
    cancel: &CancellationToken,
  ) -> Result<Status, ServiceError> {
    Ok(self.engine.insert_workstatus(status, cancel).await?)
  }

  pub async fn update_workstatus(
    &self,
    status: Status,
    cancel: &CancellationToken,
  ) -> Result<Status, ServiceError> {
    Ok(self.engine.update_workstatus(status, cancel).await?)
  }

  /// Add a new option (step) out of a status.
  pub async fn insert_option_action(
    &self,
    option: NewOption,
    cancel: &CancellationToken,
  ) -> Result<StatusOption, ServiceError> {
    Ok(self.engine.insert_option(option, cancel).await?)
  }

  pub async fn insert_action(
    &self,
    action: NewAction,
    cancel: &CancellationToken,
  ) -> Result<StatusAction, ServiceError> {
    Ok(self.engine.insert_action(action, cancel).await?)
  }

  pub async fn insert_rule(
    &self,
    rule: NewRule,
    cancel: &CancellationToken,
  ) -> Result<StatusRule, ServiceError> {
    Ok(self.engine.insert_rule(rule, cancel).await?)
  }

  pub async fn insert_validation(
    &self,
    validation: NewValidation,
    cancel: &CancellationToken,
  ) -> Result<StatusValidation, ServiceError> {
    Ok(self.engine.insert_validation(validation, cancel).await?)
  }

  pub async fn copy_workflow(
    &self,
    from: WorkflowId,
    to: WorkflowId,
    cancel: &CancellationToken,
  ) -> Result<WorkflowDefinition, ServiceError> {
    Ok(self.engine.copy_workflow(from, to, cancel).await?)
  }

  pub async fn copy_actions(
    &self,
    src: OptionId,
    dest: OptionId,
    cancel: &CancellationToken,
  ) -> Result<Vec<StatusAction>, ServiceError> {
    Ok(self.engine.copy_actions(src, dest, cancel).await?)
  }

  pub async fn copy_rules(
    &self,
    src: OptionId,
    dest: OptionId,
    cancel: &CancellationToken,
  ) -> Result<Vec<StatusRule>, ServiceError> {
    Ok(self.engine.copy_rules(src, dest, cancel).await?)
  }

  async fn steps(&self, workflow_id: WorkflowId) -> Result<Vec<StepView>, EngineError> {
    let graph = self.engine.graph(workflow_id).await?;
    let compo = graph.workflow().compo;
    let mut steps = Vec::new();
    for status in graph.statuses() {
      for option in graph.all_options_for_status(status.status_id)? {
        steps.push(StepView::new(&graph, option, compo));
      }
    }
    debug!(workflow_id = %workflow_id, steps = steps.len(), "steps listed");
    Ok(steps)
  }

  async fn steps_for_status(
    &self,
    workflow_id: WorkflowId,
    status_id: StatusId,
    compo: Option<Compo>,
  ) -> Result<Vec<StepView>, EngineError> {
    let graph = self.engine.graph(workflow_id).await?;
    let compo = compo.unwrap_or(graph.workflow().compo);
    Ok(
      graph
        .options_for_status(status_id, compo)?
        .into_iter()
        .map(|option| StepView::new(&graph, option, compo))
        .collect(),
    )
  }

  async fn available_steps(
    &self,
    ref_id: RefId,
    module: ModuleId,
  ) -> Result<Vec<StepView>, EngineError> {
    let case = self.engine.case(ref_id, module).await?;
    match case.status_id {
      Some(status_id) => {
        self
          .steps_for_status(case.workflow_id, status_id, None)
          .await
      }
      None => Ok(Vec::new()),
    }
  }

  async fn workstatuses(
    &self,
    ref_id: RefId,
    module: Option<ModuleId>,
  ) -> Result<Vec<WorkstatusView>, EngineError> {
    let rows = self.engine.history(ref_id, module).await?;
    let mut descriptions: HashMap<StatusId, String> = HashMap::new();
    let mut views = Vec::with_capacity(rows.len());
    for row in rows {
      let description = match descriptions.get(&row.status_id) {
        Some(description) => description.clone(),
        None => {
          let description = match self.engine.store().find_status(row.status_id).await {
            Ok(status) => status.description,
            // The status has since been removed from its definition
            Err(ect_store::Error::NotFound(_)) => format!("status {}", row.status_id),
            Err(e) => return Err(e.into()),
          };
          descriptions.insert(row.status_id, description.clone());
          description
        }
      };
      views.push(WorkstatusView::new(row, description));
    }
    Ok(views)
  }
}
