//! Case start and forward transitions.
//!
//! A transition runs as:
//!
//! ```text
//! lock ─▶ check current status ─▶ validations ─▶ rules ─▶ actions ─▶ commit ─▶ unlock
//! ```
//!
//! Everything up to the commit only reads; the commit writes the tracking
//! close/open pair, the case pointer and all staged action effects in one
//! store transaction. Cancellation is honoured up to the commit and ignored
//! after it.

use chrono::Utc;
use ect_config::{ModuleId, OptionId, RefId, SignatureId, StatusId, TrackingId, WorkflowId};
use ect_store::{CaseFields, CaseRecord, TrackingOpen, TransitionCommit};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::audit::AuditTracker;
use crate::context::{Actor, CaseContext};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::events::EngineEvent;

/// Put a new case into a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartCaseRequest {
  pub ref_id: RefId,
  pub module: ModuleId,
  pub workflow_id: WorkflowId,
  pub actor: Actor,
  #[serde(default)]
  pub fields: CaseFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartOutcome {
  pub ref_id: RefId,
  pub module: ModuleId,
  pub workflow_id: WorkflowId,
  pub status_id: StatusId,
  pub tracking_id: TrackingId,
}

/// Move a case along one of its current status's options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRequest {
  pub ref_id: RefId,
  pub module: ModuleId,
  pub option_id: OptionId,
  pub actor: Actor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionOutcome {
  pub ref_id: RefId,
  pub module: ModuleId,
  pub option_id: OptionId,
  /// Workflow the case is in after the transition.
  pub workflow_id: WorkflowId,
  pub from: StatusId,
  /// `None` when the option was terminal.
  pub to: Option<StatusId>,
  /// The newly opened tracking row.
  pub tracking_id: Option<TrackingId>,
  pub completed: bool,
  pub signatures: Vec<SignatureId>,
}

struct PreparedTransition {
  commit: TransitionCommit,
  from: StatusId,
  notifications: Vec<String>,
}

impl Engine {
  /// Create a case at its workflow's initial status.
  #[instrument(
    name = "case_start",
    skip(self, request, cancel),
    fields(
      ref_id = %request.ref_id,
      module = %request.module,
      workflow_id = %request.workflow_id,
    )
  )]
  pub async fn start_case(
    &self,
    request: &StartCaseRequest,
    cancel: &CancellationToken,
  ) -> Result<StartOutcome, EngineError> {
    if cancel.is_cancelled() {
      return Err(EngineError::Cancelled);
    }

    let graph = self.graph(request.workflow_id).await?;
    let workflow = graph.workflow();
    if !workflow.active {
      return Err(EngineError::invalid_request(format!(
        "workflow {} is inactive",
        workflow.workflow_id
      )));
    }
    if workflow.module != request.module {
      return Err(EngineError::invalid_request(format!(
        "workflow {} belongs to module {}, not {}",
        workflow.workflow_id, workflow.module, request.module
      )));
    }
    let initial = graph.initial_status()?.status_id;

    let claim = self
      .lock_case(request.ref_id, request.module, &request.actor)
      .await?;

    let result = if cancel.is_cancelled() {
      Err(EngineError::Cancelled)
    } else {
      let now = Utc::now();
      let case = CaseRecord {
        ref_id: request.ref_id,
        module: request.module,
        workflow_id: request.workflow_id,
        status_id: Some(initial),
        fields: request.fields.clone(),
        created_at: now,
        completed_at: None,
      };
      let open = TrackingOpen {
        ref_id: request.ref_id,
        module: request.module,
        status_id: initial,
        started_at: now,
        started_by: request.actor.user_id,
      };
      self
        .store
        .create_case(&case, &open)
        .await
        .map_err(|e| match e {
          ect_store::Error::Conflict(message) => EngineError::InvalidRequest { message },
          other => other.into(),
        })
    };

    self.unlock_case(claim).await;

    let tracking_id = result?;
    info!(
      ref_id = %request.ref_id,
      module = %request.module,
      status_id = %initial,
      tracking_id = %tracking_id,
      "case_started"
    );
    self.notifier.notify(EngineEvent::CaseStarted {
      ref_id: request.ref_id,
      module: request.module,
      workflow_id: request.workflow_id,
      status_id: initial,
      user_id: request.actor.user_id,
    });

    Ok(StartOutcome {
      ref_id: request.ref_id,
      module: request.module,
      workflow_id: request.workflow_id,
      status_id: initial,
      tracking_id,
    })
  }

  /// Move a case along an option.
  #[instrument(
    name = "case_transition",
    skip(self, request, cancel),
    fields(
      ref_id = %request.ref_id,
      module = %request.module,
      option_id = %request.option_id,
      user_id = %request.actor.user_id,
    )
  )]
  pub async fn transition(
    &self,
    request: &TransitionRequest,
    cancel: &CancellationToken,
  ) -> Result<TransitionOutcome, EngineError> {
    if cancel.is_cancelled() {
      warn!(ref_id = %request.ref_id, "transition cancelled before start");
      return Err(EngineError::Cancelled);
    }

    let transition_id = uuid::Uuid::new_v4().to_string();
    let claim = self
      .lock_case(request.ref_id, request.module, &request.actor)
      .await?;

    let result = self.transition_locked(request, cancel).await;

    self.unlock_case(claim).await;

    match &result {
      Ok(outcome) => {
        info!(
          transition_id = %transition_id,
          ref_id = %request.ref_id,
          from = %outcome.from,
          to = ?outcome.to,
          completed = outcome.completed,
          "transition_committed"
        );
      }
      Err(e) => {
        warn!(
          transition_id = %transition_id,
          ref_id = %request.ref_id,
          kind = ?e.kind(),
          error = %e,
          "transition_rejected"
        );
      }
    }

    result
  }

  async fn transition_locked(
    &self,
    request: &TransitionRequest,
    cancel: &CancellationToken,
  ) -> Result<TransitionOutcome, EngineError> {
    let prepared = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        prepared = self.prepare_transition(request) => prepared?,
    };

    // Last point where cancellation has an effect
    if cancel.is_cancelled() {
      return Err(EngineError::Cancelled);
    }

    let committed = self.store.commit_transition(&prepared.commit).await?;

    let to = prepared.commit.open.as_ref().map(|o| o.status_id);
    self.notifier.notify(EngineEvent::Transitioned {
      ref_id: request.ref_id,
      module: request.module,
      option_id: request.option_id,
      from: prepared.from,
      to,
      user_id: request.actor.user_id,
    });
    for group in prepared.notifications {
      self.notifier.notify(EngineEvent::GroupNotified {
        ref_id: request.ref_id,
        module: request.module,
        option_id: request.option_id,
        group,
      });
    }

    Ok(TransitionOutcome {
      ref_id: request.ref_id,
      module: request.module,
      option_id: request.option_id,
      workflow_id: prepared.commit.workflow_id,
      from: prepared.from,
      to,
      tracking_id: committed.opened,
      completed: to.is_none(),
      signatures: committed.signatures,
    })
  }

  /// Everything before the commit. Reads only.
  async fn prepare_transition(
    &self,
    request: &TransitionRequest,
  ) -> Result<PreparedTransition, EngineError> {
    let case = self.store.get_case(request.ref_id, request.module).await?;
    if case.is_complete() {
      return Err(EngineError::StaleState {
        message: format!("case {} (module {}) is complete", case.ref_id, case.module),
      });
    }
    let current = self
      .audit
      .current(request.ref_id, request.module)
      .await?
      .ok_or_else(|| EngineError::StaleState {
        message: format!(
          "case {} (module {}) has no open tracking row",
          case.ref_id, case.module
        ),
      })?;

    let graph = self.graph(case.workflow_id).await?;
    let Some(option) = graph.option(request.option_id) else {
      // An option of a workflow the case has since left is stale, not unknown
      return match self.store.find_option(request.option_id).await {
        Ok(_) => Err(EngineError::StaleState {
          message: format!(
            "option {} is not offered in workflow {}",
            request.option_id, case.workflow_id
          ),
        }),
        Err(e) => Err(e.into()),
      };
    };
    if !option.active || !option.visible_to(graph.workflow().compo) {
      return Err(EngineError::not_found(format!("option {}", option.option_id)));
    }
    if option.status_id != current.status_id {
      return Err(EngineError::StaleState {
        message: format!(
          "option {} leaves status {} but case is at status {}",
          option.option_id, option.status_id, current.status_id
        ),
      });
    }

    let signatures = self
      .store
      .list_signatures(request.ref_id, request.module)
      .await?;
    let ctx = CaseContext::new(case, request.actor.clone(), signatures);

    let validations = self
      .evaluator
      .evaluate_status_validations(&graph, current.status_id, &ctx)?;
    if !validations.passed {
      return Err(EngineError::ValidationsFailed {
        status_id: current.status_id,
        validations: validations.failed,
      });
    }

    let rules = self.evaluator.evaluate(&graph, option.option_id, &ctx)?;
    if !rules.passed {
      return Err(EngineError::RulesFailed {
        option_id: option.option_id,
        rules: rules.failed,
      });
    }

    let now = Utc::now();
    let actions = graph.actions_for(option.option_id)?;
    let staged = self
      .actions
      .run(&actions, &ctx, current.status_id, now)?;

    let (to, workflow_id) = match option.target {
      None => (None, ctx.case.workflow_id),
      Some(target) if option.cross_workflow => {
        let status = self.store.find_status(target).await?;
        (Some(target), status.workflow_id)
      }
      Some(target) => (Some(target), graph.workflow().workflow_id),
    };

    let (close, open) = AuditTracker::stage_move(&current, to, &request.actor, now);
    Ok(PreparedTransition {
      commit: TransitionCommit {
        ref_id: request.ref_id,
        module: request.module,
        workflow_id,
        close,
        open,
        fields: staged.fields,
        signatures: staged.signatures,
        return_record: None,
      },
      from: current.status_id,
      notifications: staged.notifications,
    })
  }
}
