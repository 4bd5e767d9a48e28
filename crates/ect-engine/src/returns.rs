//! Returns and RWOAs.
//!
//! A return sends a case back to a status it already passed through. It does
//! not use the option graph, so no option rules, status validations or
//! actions run; the reason code and explanation are the only checks.

use chrono::Utc;
use ect_config::{ModuleId, RefId, ReturnId, StatusId, TrackingId, WorkflowId};
use ect_store::{NewReturn, ReturnKind, TransitionCommit};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::audit::AuditTracker;
use crate::context::Actor;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::events::EngineEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnRequest {
  pub ref_id: RefId,
  pub module: ModuleId,
  pub kind: ReturnKind,
  /// A status the case occupied earlier.
  pub target: StatusId,
  pub reason: i32,
  pub explanation: String,
  /// Recipient group.
  #[serde(default)]
  pub sent_to: Option<String>,
  pub actor: Actor,
}

impl ReturnRequest {
  fn validate(&self) -> Result<(), EngineError> {
    if self.reason <= 0 {
      return Err(EngineError::invalid_request("a reason code is required"));
    }
    if self.explanation.trim().is_empty() {
      return Err(EngineError::invalid_request("an explanation is required"));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnOutcome {
  pub return_id: ReturnId,
  pub kind: ReturnKind,
  pub workflow_id: WorkflowId,
  pub from: StatusId,
  pub to: StatusId,
  pub tracking_id: TrackingId,
  pub rerouting: bool,
}

/// A return is rerouted when the recipient is not the group that works the
/// target status.
pub fn is_rerouting(owner_group: Option<&str>, sent_to: Option<&str>) -> bool {
  match (owner_group, sent_to) {
    (Some(owner), Some(to)) => owner != to,
    _ => false,
  }
}

impl Engine {
  /// Send a case back to an earlier status.
  #[instrument(
    name = "case_return",
    skip(self, request, cancel),
    fields(
      ref_id = %request.ref_id,
      module = %request.module,
      kind = %request.kind,
      target = %request.target,
    )
  )]
  pub async fn return_case(
    &self,
    request: &ReturnRequest,
    cancel: &CancellationToken,
  ) -> Result<ReturnOutcome, EngineError> {
    if cancel.is_cancelled() {
      return Err(EngineError::Cancelled);
    }
    request.validate()?;

    let claim = self
      .lock_case(request.ref_id, request.module, &request.actor)
      .await?;

    let result = self.return_locked(request, cancel).await;

    self.unlock_case(claim).await;

    match &result {
      Ok(outcome) => info!(
        return_id = %outcome.return_id,
        from = %outcome.from,
        to = %outcome.to,
        rerouting = outcome.rerouting,
        "return_committed"
      ),
      Err(e) => warn!(kind = ?e.kind(), error = %e, "return_rejected"),
    }

    result
  }

  async fn return_locked(
    &self,
    request: &ReturnRequest,
    cancel: &CancellationToken,
  ) -> Result<ReturnOutcome, EngineError> {
    let commit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        commit = self.prepare_return(request) => commit?,
    };

    if cancel.is_cancelled() {
      return Err(EngineError::Cancelled);
    }

    let committed = self.store.commit_transition(&commit).await?;
    let (Some(tracking_id), Some(return_id), Some(record)) = (
      committed.opened,
      committed.return_id,
      commit.return_record.as_ref(),
    ) else {
      return Err(EngineError::Store(ect_store::Error::InvalidData(
        "return committed without tracking row or return record".to_string(),
      )));
    };

    self.notifier.notify(EngineEvent::Returned {
      ref_id: request.ref_id,
      module: request.module,
      kind: request.kind,
      from: record.status_from,
      to: record.status_to,
      rerouting: record.rerouting,
      user_id: request.actor.user_id,
    });

    Ok(ReturnOutcome {
      return_id,
      kind: request.kind,
      workflow_id: commit.workflow_id,
      from: record.status_from,
      to: record.status_to,
      tracking_id,
      rerouting: record.rerouting,
    })
  }

  async fn prepare_return(&self, request: &ReturnRequest) -> Result<TransitionCommit, EngineError> {
    let case = self.store.get_case(request.ref_id, request.module).await?;
    if case.is_complete() {
      return Err(EngineError::StaleState {
        message: format!("case {} (module {}) is complete", case.ref_id, case.module),
      });
    }

    let history = self
      .audit
      .history(request.ref_id, Some(request.module))
      .await?;
    let current = history
      .iter()
      .find(|t| t.is_open())
      .ok_or_else(|| EngineError::StaleState {
        message: format!(
          "case {} (module {}) has no open tracking row",
          case.ref_id, case.module
        ),
      })?;

    if request.target == current.status_id {
      return Err(EngineError::invalid_request(format!(
        "case is already at status {}",
        request.target
      )));
    }
    let occupied = history
      .iter()
      .any(|t| !t.is_open() && t.status_id == request.target);
    if !occupied {
      return Err(EngineError::invalid_request(format!(
        "case never occupied status {}",
        request.target
      )));
    }

    let target = self.store.find_status(request.target).await?;
    let rerouting = is_rerouting(target.owner_group.as_deref(), request.sent_to.as_deref());

    let now = Utc::now();
    let (close, open) = AuditTracker::stage_move(current, Some(target.status_id), &request.actor, now);
    Ok(TransitionCommit {
      ref_id: request.ref_id,
      module: request.module,
      workflow_id: target.workflow_id,
      close,
      open,
      fields: None,
      signatures: Vec::new(),
      return_record: Some(NewReturn {
        kind: request.kind,
        status_from: current.status_id,
        status_to: target.status_id,
        reason: request.reason,
        explanation: request.explanation.trim().to_string(),
        sent_by: request.actor.user_id,
        sent_by_name: request.actor.name_rank(),
        sent_to: request.sent_to.clone(),
        rerouting,
        created_at: now,
      }),
    })
  }
}
