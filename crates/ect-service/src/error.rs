use chrono::{DateTime, Utc};
use ect_config::{ActionId, OptionId, StatusId, UserId};
use ect_engine::{EngineError, ErrorKind, FailedCheck};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

/// Structured detail kept for the caller on client-facing failures.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorDetail {
  Locked {
    held_by: String,
    held_by_id: UserId,
    since: DateTime<Utc>,
  },
  RulesFailed {
    option_id: OptionId,
    rules: Vec<FailedCheck>,
  },
  ValidationsFailed {
    status_id: StatusId,
    validations: Vec<FailedCheck>,
  },
  ActionFailed {
    action_id: ActionId,
    action_type: String,
  },
}

/// The error every service call returns.
///
/// Internal failures carry only a generic message and a correlation id that
/// matches the logged error.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct ServiceError {
  pub kind: ErrorKind,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub correlation_id: Option<Uuid>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub detail: Option<ErrorDetail>,
}

impl ServiceError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      correlation_id: None,
      detail: None,
    }
  }

  pub fn cancelled() -> Self {
    Self::new(ErrorKind::Cancelled, "operation cancelled")
  }

  pub fn is_retryable(&self) -> bool {
    self.kind.is_retryable()
  }
}

impl From<EngineError> for ServiceError {
  fn from(err: EngineError) -> Self {
    let kind = err.kind();
    if kind == ErrorKind::Internal {
      let correlation_id = Uuid::new_v4();
      error!(
        correlation_id = %correlation_id,
        error = %err,
        source = ?std::error::Error::source(&err),
        "internal error"
      );
      return Self {
        kind,
        message: format!("internal error (reference {})", correlation_id),
        correlation_id: Some(correlation_id),
        detail: None,
      };
    }

    let message = err.to_string();
    let detail = match err {
      EngineError::Locked {
        held_by,
        held_by_id,
        since,
        ..
      } => Some(ErrorDetail::Locked {
        held_by,
        held_by_id,
        since,
      }),
      EngineError::RulesFailed { option_id, rules } => {
        Some(ErrorDetail::RulesFailed { option_id, rules })
      }
      EngineError::ValidationsFailed {
        status_id,
        validations,
      } => Some(ErrorDetail::ValidationsFailed {
        status_id,
        validations,
      }),
      EngineError::ActionFailed {
        action_id,
        action_type,
        ..
      } => Some(ErrorDetail::ActionFailed {
        action_id,
        action_type,
      }),
      _ => None,
    };

    Self {
      kind,
      message,
      correlation_id: None,
      detail,
    }
  }
}
