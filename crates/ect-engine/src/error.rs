//! Engine errors.

use chrono::{DateTime, Utc};
use ect_config::{ActionId, ModuleId, OptionId, RefId, StatusId, UserId};
use ect_workflow::WorkflowError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One rule or validation that did not pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCheck {
  /// Rule or validation id.
  pub id: i64,
  /// The type tag of the check, e.g. `require_field`.
  pub check_type: String,
  pub message: String,
}

/// Coarse error classification preserved across the call surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  NotFound,
  Locked,
  StaleState,
  RulesFailed,
  ValidationsFailed,
  ActionFailed,
  Cancelled,
  InvalidRequest,
  InvalidDefinition,
  Internal,
}

impl ErrorKind {
  /// Whether retrying the same request later can succeed.
  ///
  /// Only lock conflicts qualify. Actions are not known to be idempotent, so
  /// a failed action needs an operator before the request is sent again.
  pub fn is_retryable(&self) -> bool {
    matches!(self, ErrorKind::Locked)
  }
}

/// Errors that can occur while running the workflow engine.
#[derive(Debug, Error)]
pub enum EngineError {
  /// An unknown workflow, status, option, case or lock.
  #[error("{what} not found")]
  NotFound { what: String },

  /// The case is locked by another user.
  #[error("case {ref_id} (module {module}) is locked by {held_by} since {since}")]
  Locked {
    ref_id: RefId,
    module: ModuleId,
    held_by: String,
    held_by_id: UserId,
    since: DateTime<Utc>,
  },

  /// The case moved since the request was formed.
  #[error("stale state: {message}")]
  StaleState { message: String },

  /// Option rules did not pass.
  #[error("rules failed for option {option_id}: {}", check_types(.rules))]
  RulesFailed {
    option_id: OptionId,
    rules: Vec<FailedCheck>,
  },

  /// Status validations did not pass.
  #[error("validations failed for status {status_id}: {}", check_types(.validations))]
  ValidationsFailed {
    status_id: StatusId,
    validations: Vec<FailedCheck>,
  },

  /// An action could not produce its effect.
  #[error("action {action_id} ({action_type}) failed: {message}")]
  ActionFailed {
    action_id: ActionId,
    action_type: String,
    message: String,
  },

  /// The caller cancelled before the commit.
  #[error("operation cancelled")]
  Cancelled,

  /// The request itself is malformed.
  #[error("invalid request: {message}")]
  InvalidRequest { message: String },

  /// A workflow definition failed load-time validation.
  #[error("invalid workflow definition: {message}")]
  InvalidDefinition { message: String },

  /// Storage failure.
  #[error("store error")]
  Store(#[source] ect_store::Error),
}

fn check_types(checks: &[FailedCheck]) -> String {
  checks
    .iter()
    .map(|c| c.check_type.as_str())
    .collect::<Vec<_>>()
    .join(", ")
}

impl EngineError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      EngineError::NotFound { .. } => ErrorKind::NotFound,
      EngineError::Locked { .. } => ErrorKind::Locked,
      EngineError::StaleState { .. } => ErrorKind::StaleState,
      EngineError::RulesFailed { .. } => ErrorKind::RulesFailed,
      EngineError::ValidationsFailed { .. } => ErrorKind::ValidationsFailed,
      EngineError::ActionFailed { .. } => ErrorKind::ActionFailed,
      EngineError::Cancelled => ErrorKind::Cancelled,
      EngineError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
      EngineError::InvalidDefinition { .. } => ErrorKind::InvalidDefinition,
      EngineError::Store(_) => ErrorKind::Internal,
    }
  }

  pub(crate) fn not_found(what: impl Into<String>) -> Self {
    EngineError::NotFound { what: what.into() }
  }

  pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
    EngineError::InvalidRequest {
      message: message.into(),
    }
  }

  pub(crate) fn invalid_definition(message: impl Into<String>) -> Self {
    EngineError::InvalidDefinition {
      message: message.into(),
    }
  }
}

impl From<ect_store::Error> for EngineError {
  fn from(err: ect_store::Error) -> Self {
    match err {
      ect_store::Error::NotFound(what) => EngineError::NotFound { what },
      ect_store::Error::Conflict(message) => EngineError::StaleState { message },
      other => EngineError::Store(other),
    }
  }
}

impl From<WorkflowError> for EngineError {
  fn from(err: WorkflowError) -> Self {
    match err {
      WorkflowError::StatusNotFound(id) => EngineError::not_found(format!("status {}", id)),
      WorkflowError::OptionNotFound(id) => EngineError::not_found(format!("option {}", id)),
      other => EngineError::invalid_definition(other.to_string()),
    }
  }
}
