use ect_config::{ActionId, OptionId, RuleId, StatusId, ValidationId, WorkflowId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error("status not found: {0}")]
  StatusNotFound(StatusId),

  #[error("option not found: {0}")]
  OptionNotFound(OptionId),

  #[error("workflow {0} has no initial status")]
  NoInitialStatus(WorkflowId),

  #[error("initial status {status_id} does not belong to workflow {workflow_id}")]
  InvalidInitialStatus {
    workflow_id: WorkflowId,
    status_id: StatusId,
  },

  #[error("status {status_id} belongs to workflow {owner}, not {workflow_id}")]
  ForeignStatus {
    status_id: StatusId,
    owner: WorkflowId,
    workflow_id: WorkflowId,
  },

  #[error("duplicate {kind} id: {id}")]
  DuplicateId { kind: &'static str, id: i64 },

  #[error("option {option_id} leaves from unknown status {status_id}")]
  OrphanOption {
    option_id: OptionId,
    status_id: StatusId,
  },

  #[error("option {option_id} targets status {target} outside the workflow without the cross-workflow flag")]
  InvalidTarget { option_id: OptionId, target: StatusId },

  #[error("option {option_id} is flagged cross-workflow but targets status {target} of its own workflow")]
  LocalCrossWorkflowTarget { option_id: OptionId, target: StatusId },

  #[error("action {action_id} references unknown option {option_id}")]
  OrphanAction {
    action_id: ActionId,
    option_id: OptionId,
  },

  #[error("rule {rule_id} references unknown option {option_id}")]
  OrphanRule { rule_id: RuleId, option_id: OptionId },

  #[error("validation {validation_id} references unknown status {status_id}")]
  OrphanValidation {
    validation_id: ValidationId,
    status_id: StatusId,
  },
}
