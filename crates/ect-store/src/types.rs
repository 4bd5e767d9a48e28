use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ect_config::{
  ModuleId, RefId, ReturnId, SignatureId, StatusId, TrackingId, UserId, WorkflowId,
};
use serde::{Deserialize, Serialize};

/// Case data as a JSON object (field name -> value).
pub type CaseFields = serde_json::Map<String, serde_json::Value>;

/// A case moving through a workflow, keyed by (ref_id, module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
  pub ref_id: RefId,
  pub module: ModuleId,
  pub workflow_id: WorkflowId,
  /// The current status. `None` once the case is complete.
  pub status_id: Option<StatusId>,
  pub fields: CaseFields,
  pub created_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl CaseRecord {
  pub fn is_complete(&self) -> bool {
    self.completed_at.is_some()
  }
}

/// One audit row: the time a case spent in one status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTracking {
  pub tracking_id: TrackingId,
  pub ref_id: RefId,
  pub module: ModuleId,
  pub status_id: StatusId,
  pub started_at: DateTime<Utc>,
  pub started_by: UserId,
  pub ended_at: Option<DateTime<Utc>>,
  pub completed_by: Option<UserId>,
  /// Snapshot of the closing actor's rank and name.
  pub completed_by_name: Option<String>,
}

impl StatusTracking {
  pub fn is_open(&self) -> bool {
    self.ended_at.is_none()
  }
}

/// Insert half of a tracking row.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingOpen {
  pub ref_id: RefId,
  pub module: ModuleId,
  pub status_id: StatusId,
  pub started_at: DateTime<Utc>,
  pub started_by: UserId,
}

/// Close half of a tracking row.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingClose {
  pub tracking_id: TrackingId,
  pub ended_at: DateTime<Utc>,
  pub completed_by: UserId,
  pub completed_by_name: String,
}

/// Mutual-exclusion record for one (ref_id, module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowLock {
  pub ref_id: RefId,
  pub module: ModuleId,
  pub user_id: UserId,
  pub user_name: String,
  pub acquired_at: DateTime<Utc>,
  /// Set while an engine operation works the case under this lock.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub operation: Option<String>,
}

impl WorkflowLock {
  pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
    now - self.acquired_at
  }
}

/// Kind of backward routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnKind {
  /// Sent back for correction.
  Return,
  /// Returned without action.
  Rwoa,
}

impl ReturnKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ReturnKind::Return => "return",
      ReturnKind::Rwoa => "rwoa",
    }
  }
}

impl fmt::Display for ReturnKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ReturnKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "return" => Ok(ReturnKind::Return),
      "rwoa" => Ok(ReturnKind::Rwoa),
      other => Err(format!("unknown return kind: {}", other)),
    }
  }
}

/// A recorded return / RWOA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnRecord {
  pub return_id: ReturnId,
  pub ref_id: RefId,
  pub module: ModuleId,
  pub kind: ReturnKind,
  pub status_from: StatusId,
  pub status_to: StatusId,
  pub reason: i32,
  pub explanation: String,
  pub sent_by: UserId,
  pub sent_by_name: String,
  pub sent_to: Option<String>,
  pub rerouting: bool,
  pub created_at: DateTime<Utc>,
}

/// A return / RWOA before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReturn {
  pub kind: ReturnKind,
  pub status_from: StatusId,
  pub status_to: StatusId,
  pub reason: i32,
  pub explanation: String,
  pub sent_by: UserId,
  pub sent_by_name: String,
  pub sent_to: Option<String>,
  pub rerouting: bool,
  pub created_at: DateTime<Utc>,
}

/// A signature recorded against a case at a status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
  pub signature_id: SignatureId,
  pub ref_id: RefId,
  pub module: ModuleId,
  pub status_id: StatusId,
  pub user_id: UserId,
  pub name_rank: String,
  pub signed_at: DateTime<Utc>,
}

/// A signature before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSignature {
  pub ref_id: RefId,
  pub module: ModuleId,
  pub status_id: StatusId,
  pub user_id: UserId,
  pub name_rank: String,
  pub signed_at: DateTime<Utc>,
}

/// Everything a transition or return writes, committed as one unit.
///
/// The store closes `close` only if it is still the open row for the case,
/// so a concurrent writer makes the commit fail with a conflict instead of
/// producing two open rows.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionCommit {
  pub ref_id: RefId,
  pub module: ModuleId,
  /// Workflow the case belongs to after the commit.
  pub workflow_id: WorkflowId,
  pub close: TrackingClose,
  /// `None` completes the case.
  pub open: Option<TrackingOpen>,
  /// Replacement case fields, when actions changed them.
  pub fields: Option<CaseFields>,
  pub signatures: Vec<NewSignature>,
  pub return_record: Option<NewReturn>,
}

/// Ids assigned while committing a [`TransitionCommit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitOutcome {
  pub opened: Option<TrackingId>,
  pub signatures: Vec<SignatureId>,
  pub return_id: Option<ReturnId>,
}

/// Id spaces for definition records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSpace {
  Workflow,
  Status,
  Option,
  Action,
  Rule,
  Validation,
}
