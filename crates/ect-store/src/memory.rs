use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use ect_config::{
  ModuleId, OptionId, RefId, ReturnId, SignatureId, Status, StatusId, StatusOption, TrackingId,
  UserId, Workflow, WorkflowDefinition, WorkflowId,
};
use tokio::sync::Mutex;

use crate::{
  CaseRecord, CommitOutcome, Error, IdSpace, NewSignature, ReturnRecord, Signature,
  StatusTracking, Store, TrackingClose, TrackingOpen, TransitionCommit, WorkflowLock,
};

#[derive(Debug, Default)]
struct State {
  definitions: BTreeMap<WorkflowId, WorkflowDefinition>,
  cases: HashMap<(RefId, ModuleId), CaseRecord>,
  tracking: Vec<StatusTracking>,
  locks: BTreeMap<(RefId, ModuleId), WorkflowLock>,
  signatures: Vec<Signature>,
  returns: Vec<ReturnRecord>,
  next_tracking: i64,
  next_signature: i64,
  next_return: i64,
}

impl State {
  fn open_row(&self, ref_id: RefId, module: ModuleId) -> Option<usize> {
    self
      .tracking
      .iter()
      .position(|t| t.ref_id == ref_id && t.module == module && t.is_open())
  }

  fn push_tracking(&mut self, open: &TrackingOpen) -> TrackingId {
    self.next_tracking += 1;
    let tracking_id = TrackingId(self.next_tracking);
    self.tracking.push(StatusTracking {
      tracking_id,
      ref_id: open.ref_id,
      module: open.module,
      status_id: open.status_id,
      started_at: open.started_at,
      started_by: open.started_by,
      ended_at: None,
      completed_by: None,
      completed_by_name: None,
    });
    tracking_id
  }

  fn push_signature(&mut self, signature: &NewSignature) -> SignatureId {
    self.next_signature += 1;
    let signature_id = SignatureId(self.next_signature);
    self.signatures.push(Signature {
      signature_id,
      ref_id: signature.ref_id,
      module: signature.module,
      status_id: signature.status_id,
      user_id: signature.user_id,
      name_rank: signature.name_rank.clone(),
      signed_at: signature.signed_at,
    });
    signature_id
  }

  fn apply_close(row: &mut StatusTracking, close: &TrackingClose) {
    row.ended_at = Some(close.ended_at);
    row.completed_by = Some(close.completed_by);
    row.completed_by_name = Some(close.completed_by_name.clone());
  }
}

/// In-memory store.
///
/// Suitable for tests and ephemeral runs. All operations take a single mutex,
/// which makes every write (including transition commits) atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
  state: Mutex<State>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn create_workflow(&self, workflow: &Workflow) -> Result<(), Error> {
    let mut state = self.state.lock().await;
    if state.definitions.contains_key(&workflow.workflow_id) {
      return Err(Error::Conflict(format!(
        "workflow {} already exists",
        workflow.workflow_id
      )));
    }
    state.definitions.insert(
      workflow.workflow_id,
      WorkflowDefinition::empty(workflow.clone()),
    );
    Ok(())
  }

  async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, Error> {
    let state = self.state.lock().await;
    state
      .definitions
      .get(&workflow_id)
      .map(|d| d.workflow.clone())
      .ok_or_else(|| Error::NotFound(format!("workflow {}", workflow_id)))
  }

  async fn list_workflows(&self) -> Result<Vec<Workflow>, Error> {
    let state = self.state.lock().await;
    Ok(state.definitions.values().map(|d| d.workflow.clone()).collect())
  }

  async fn load_definition(&self, workflow_id: WorkflowId) -> Result<WorkflowDefinition, Error> {
    let state = self.state.lock().await;
    state
      .definitions
      .get(&workflow_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("workflow {}", workflow_id)))
  }

  async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), Error> {
    let mut state = self.state.lock().await;
    let workflow_id = definition.workflow.workflow_id;

    // Status ids are global across workflows.
    for (other_id, other) in &state.definitions {
      if *other_id == workflow_id {
        continue;
      }
      if let Some(clash) = definition
        .statuses
        .iter()
        .find(|s| other.status(s.status_id).is_some())
      {
        return Err(Error::Conflict(format!(
          "status {} already belongs to workflow {}",
          clash.status_id, other_id
        )));
      }
    }

    state.definitions.insert(workflow_id, definition.clone());
    Ok(())
  }

  async fn find_status(&self, status_id: StatusId) -> Result<Status, Error> {
    let state = self.state.lock().await;
    state
      .definitions
      .values()
      .find_map(|d| d.status(status_id).cloned())
      .ok_or_else(|| Error::NotFound(format!("status {}", status_id)))
  }

  async fn live_statuses(&self, workflow_id: WorkflowId) -> Result<Vec<StatusId>, Error> {
    let state = self.state.lock().await;
    let Some(definition) = state.definitions.get(&workflow_id) else {
      return Ok(Vec::new());
    };
    let pointers = state
      .cases
      .values()
      .filter(|c| !c.is_complete())
      .filter_map(|c| c.status_id);
    let open_rows = state
      .tracking
      .iter()
      .filter(|t| t.is_open())
      .map(|t| t.status_id);
    let live: BTreeSet<StatusId> = pointers
      .chain(open_rows)
      .filter(|id| definition.status(*id).is_some())
      .collect();
    Ok(live.into_iter().collect())
  }

  async fn find_option(&self, option_id: OptionId) -> Result<StatusOption, Error> {
    let state = self.state.lock().await;
    state
      .definitions
      .values()
      .find_map(|d| d.option(option_id).cloned())
      .ok_or_else(|| Error::NotFound(format!("option {}", option_id)))
  }

  async fn next_id(&self, space: IdSpace) -> Result<i64, Error> {
    let state = self.state.lock().await;
    let defs = state.definitions.values();
    let max = match space {
      IdSpace::Workflow => defs.map(|d| d.workflow.workflow_id.0).max(),
      IdSpace::Status => defs.flat_map(|d| d.statuses.iter().map(|s| s.status_id.0)).max(),
      IdSpace::Option => defs.flat_map(|d| d.options.iter().map(|o| o.option_id.0)).max(),
      IdSpace::Action => defs.flat_map(|d| d.actions.iter().map(|a| a.action_id.0)).max(),
      IdSpace::Rule => defs.flat_map(|d| d.rules.iter().map(|r| r.rule_id.0)).max(),
      IdSpace::Validation => defs
        .flat_map(|d| d.validations.iter().map(|v| v.validation_id.0))
        .max(),
    };
    Ok(max.unwrap_or(0) + 1)
  }

  async fn create_case(&self, case: &CaseRecord, open: &TrackingOpen) -> Result<TrackingId, Error> {
    let mut state = self.state.lock().await;
    let key = (case.ref_id, case.module);
    if state.cases.contains_key(&key) {
      return Err(Error::Conflict(format!(
        "case {} (module {}) already exists",
        case.ref_id, case.module
      )));
    }
    if state.open_row(case.ref_id, case.module).is_some() {
      return Err(Error::Conflict(format!(
        "case {} (module {}) already has an open tracking row",
        case.ref_id, case.module
      )));
    }
    state.cases.insert(key, case.clone());
    Ok(state.push_tracking(open))
  }

  async fn get_case(&self, ref_id: RefId, module: ModuleId) -> Result<CaseRecord, Error> {
    let state = self.state.lock().await;
    state
      .cases
      .get(&(ref_id, module))
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("case {} (module {})", ref_id, module)))
  }

  async fn open_tracking(&self, open: &TrackingOpen) -> Result<TrackingId, Error> {
    let mut state = self.state.lock().await;
    if state.open_row(open.ref_id, open.module).is_some() {
      return Err(Error::Conflict(format!(
        "case {} (module {}) already has an open tracking row",
        open.ref_id, open.module
      )));
    }
    Ok(state.push_tracking(open))
  }

  async fn close_tracking(&self, close: &TrackingClose) -> Result<(), Error> {
    let mut state = self.state.lock().await;
    let row = state
      .tracking
      .iter_mut()
      .find(|t| t.tracking_id == close.tracking_id)
      .ok_or_else(|| Error::NotFound(format!("tracking row {}", close.tracking_id)))?;
    if !row.is_open() {
      return Err(Error::Conflict(format!(
        "tracking row {} is already closed",
        close.tracking_id
      )));
    }
    State::apply_close(row, close);
    Ok(())
  }

  async fn current_tracking(
    &self,
    ref_id: RefId,
    module: ModuleId,
  ) -> Result<Option<StatusTracking>, Error> {
    let state = self.state.lock().await;
    Ok(state.open_row(ref_id, module).map(|i| state.tracking[i].clone()))
  }

  async fn tracking_history(
    &self,
    ref_id: RefId,
    module: Option<ModuleId>,
  ) -> Result<Vec<StatusTracking>, Error> {
    let state = self.state.lock().await;
    Ok(
      state
        .tracking
        .iter()
        .filter(|t| t.ref_id == ref_id && module.is_none_or(|m| t.module == m))
        .cloned()
        .collect(),
    )
  }

  async fn commit_transition(&self, commit: &TransitionCommit) -> Result<CommitOutcome, Error> {
    let mut state = self.state.lock().await;
    let key = (commit.ref_id, commit.module);

    // Check everything before touching anything.
    if !state.cases.contains_key(&key) {
      return Err(Error::NotFound(format!(
        "case {} (module {})",
        commit.ref_id, commit.module
      )));
    }
    let row_idx = state
      .tracking
      .iter()
      .position(|t| {
        t.tracking_id == commit.close.tracking_id
          && t.ref_id == commit.ref_id
          && t.module == commit.module
          && t.is_open()
      })
      .ok_or_else(|| {
        Error::Conflict(format!(
          "tracking row {} is no longer open",
          commit.close.tracking_id
        ))
      })?;

    State::apply_close(&mut state.tracking[row_idx], &commit.close);

    let mut outcome = CommitOutcome::default();
    if let Some(open) = &commit.open {
      outcome.opened = Some(state.push_tracking(open));
    }

    for signature in &commit.signatures {
      let id = state.push_signature(signature);
      outcome.signatures.push(id);
    }

    if let Some(ret) = &commit.return_record {
      state.next_return += 1;
      let return_id = ReturnId(state.next_return);
      state.returns.push(ReturnRecord {
        return_id,
        ref_id: commit.ref_id,
        module: commit.module,
        kind: ret.kind,
        status_from: ret.status_from,
        status_to: ret.status_to,
        reason: ret.reason,
        explanation: ret.explanation.clone(),
        sent_by: ret.sent_by,
        sent_by_name: ret.sent_by_name.clone(),
        sent_to: ret.sent_to.clone(),
        rerouting: ret.rerouting,
        created_at: ret.created_at,
      });
      outcome.return_id = Some(return_id);
    }

    if let Some(case) = state.cases.get_mut(&key) {
      case.workflow_id = commit.workflow_id;
      case.status_id = commit.open.as_ref().map(|o| o.status_id);
      case.completed_at = match commit.open {
        Some(_) => None,
        None => Some(commit.close.ended_at),
      };
      if let Some(fields) = &commit.fields {
        case.fields = fields.clone();
      }
    }

    Ok(outcome)
  }

  async fn try_insert_lock(&self, lock: &WorkflowLock) -> Result<WorkflowLock, Error> {
    let mut state = self.state.lock().await;
    Ok(
      state
        .locks
        .entry((lock.ref_id, lock.module))
        .or_insert_with(|| lock.clone())
        .clone(),
    )
  }

  async fn get_lock(&self, ref_id: RefId, module: ModuleId) -> Result<Option<WorkflowLock>, Error> {
    let state = self.state.lock().await;
    Ok(state.locks.get(&(ref_id, module)).cloned())
  }

  async fn delete_lock(
    &self,
    ref_id: RefId,
    module: ModuleId,
    holder: Option<UserId>,
  ) -> Result<bool, Error> {
    let mut state = self.state.lock().await;
    let key = (ref_id, module);
    let matches = match (state.locks.get(&key), holder) {
      (Some(lock), Some(user)) => lock.user_id == user,
      (Some(_), None) => true,
      (None, _) => false,
    };
    if matches {
      state.locks.remove(&key);
    }
    Ok(matches)
  }

  async fn claim_lock(
    &self,
    ref_id: RefId,
    module: ModuleId,
    user_id: UserId,
    operation: &str,
  ) -> Result<bool, Error> {
    let mut state = self.state.lock().await;
    match state.locks.get_mut(&(ref_id, module)) {
      Some(lock) if lock.user_id == user_id && lock.operation.is_none() => {
        lock.operation = Some(operation.to_string());
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn finish_claim(
    &self,
    ref_id: RefId,
    module: ModuleId,
    operation: &str,
    remove: bool,
  ) -> Result<bool, Error> {
    let mut state = self.state.lock().await;
    let key = (ref_id, module);
    let Some(lock) = state.locks.get_mut(&key) else {
      return Ok(false);
    };
    if lock.operation.as_deref() != Some(operation) {
      return Ok(false);
    }
    if remove {
      state.locks.remove(&key);
    } else {
      lock.operation = None;
    }
    Ok(true)
  }

  async fn list_locks(&self) -> Result<Vec<WorkflowLock>, Error> {
    let state = self.state.lock().await;
    Ok(state.locks.values().cloned().collect())
  }

  async fn add_signature(&self, signature: &NewSignature) -> Result<SignatureId, Error> {
    let mut state = self.state.lock().await;
    Ok(state.push_signature(signature))
  }

  async fn list_signatures(&self, ref_id: RefId, module: ModuleId) -> Result<Vec<Signature>, Error> {
    let state = self.state.lock().await;
    Ok(
      state
        .signatures
        .iter()
        .filter(|s| s.ref_id == ref_id && s.module == module)
        .cloned()
        .collect(),
    )
  }

  async fn list_returns(&self, ref_id: RefId, module: ModuleId) -> Result<Vec<ReturnRecord>, Error> {
    let state = self.state.lock().await;
    Ok(
      state
        .returns
        .iter()
        .filter(|r| r.ref_id == ref_id && r.module == module)
        .cloned()
        .collect(),
    )
  }
}
