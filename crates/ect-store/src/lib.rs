//! ECT Store
//!
//! This crate provides the storage trait and implementations for the ECT
//! workflow engine. Data is persisted to a relational database (SQLite) or
//! kept in memory.
//!
//! The [`Store`] trait defines operations for:
//! - Reading and replacing workflow definitions (statuses, options, actions,
//!   rules, validations)
//! - Creating cases and committing transitions atomically
//! - Appending and closing status tracking rows
//! - Lock rows, signatures and return / RWOA records

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{
  CaseFields, CaseRecord, CommitOutcome, IdSpace, NewReturn, NewSignature, ReturnKind,
  ReturnRecord, Signature, StatusTracking, TrackingClose, TrackingOpen, TransitionCommit,
  WorkflowLock,
};

use async_trait::async_trait;
use ect_config::{
  ModuleId, OptionId, RefId, SignatureId, Status, StatusId, StatusOption, TrackingId, UserId,
  Workflow, WorkflowDefinition, WorkflowId,
};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// The write conflicts with the current state (already exists, already closed, ...).
  #[error("conflict: {0}")]
  Conflict(String),

  /// A stored value could not be interpreted.
  #[error("invalid stored data: {0}")]
  InvalidData(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Migrations failed to apply.
  #[error("migration error: {0}")]
  Migration(#[from] sqlx::migrate::MigrateError),

  /// A JSON column could not be encoded or decoded.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// Storage trait for workflow definitions and case state.
#[async_trait]
pub trait Store: Send + Sync {
  /// Create a workflow header with no statuses.
  async fn create_workflow(&self, workflow: &Workflow) -> Result<(), Error>;

  /// Get a workflow header by ID.
  async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, Error>;

  /// List all workflow headers.
  async fn list_workflows(&self) -> Result<Vec<Workflow>, Error>;

  /// Load a workflow with every status, option, action, rule and validation.
  async fn load_definition(&self, workflow_id: WorkflowId) -> Result<WorkflowDefinition, Error>;

  /// Replace a workflow's definition as one unit.
  async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), Error>;

  /// Look up a status in any workflow.
  async fn find_status(&self, status_id: StatusId) -> Result<Status, Error>;

  /// Look up an option in any workflow.
  async fn find_option(&self, option_id: OptionId) -> Result<StatusOption, Error>;

  /// Statuses of a workflow that an unfinished case points at or that hold
  /// an open tracking row, in ascending order.
  async fn live_statuses(&self, workflow_id: WorkflowId) -> Result<Vec<StatusId>, Error>;

  /// Next free id in a definition id space.
  async fn next_id(&self, space: IdSpace) -> Result<i64, Error>;

  /// Create a case together with its first open tracking row.
  async fn create_case(&self, case: &CaseRecord, open: &TrackingOpen) -> Result<TrackingId, Error>;

  /// Get a case by reference.
  async fn get_case(&self, ref_id: RefId, module: ModuleId) -> Result<CaseRecord, Error>;

  /// Append an open tracking row. Fails if the case already has one.
  async fn open_tracking(&self, open: &TrackingOpen) -> Result<TrackingId, Error>;

  /// Close an open tracking row. Fails if it is already closed.
  async fn close_tracking(&self, close: &TrackingClose) -> Result<(), Error>;

  /// The open tracking row for a case, if any.
  async fn current_tracking(
    &self,
    ref_id: RefId,
    module: ModuleId,
  ) -> Result<Option<StatusTracking>, Error>;

  /// Tracking rows for a reference in chronological order, optionally for one module.
  async fn tracking_history(
    &self,
    ref_id: RefId,
    module: Option<ModuleId>,
  ) -> Result<Vec<StatusTracking>, Error>;

  /// Apply a transition: close, open, case pointer, signatures and return record.
  async fn commit_transition(&self, commit: &TransitionCommit) -> Result<CommitOutcome, Error>;

  /// Insert a lock unless one exists. Returns whichever lock is now held.
  async fn try_insert_lock(&self, lock: &WorkflowLock) -> Result<WorkflowLock, Error>;

  /// Get the lock on a case, if any.
  async fn get_lock(&self, ref_id: RefId, module: ModuleId) -> Result<Option<WorkflowLock>, Error>;

  /// Delete a lock. With `holder` set, only that user's lock is removed.
  /// Returns whether a row was deleted.
  async fn delete_lock(
    &self,
    ref_id: RefId,
    module: ModuleId,
    holder: Option<UserId>,
  ) -> Result<bool, Error>;

  /// Mark the holder's lock as busy with `operation`. Returns false unless
  /// `user_id` holds the lock and no other operation has marked it.
  async fn claim_lock(
    &self,
    ref_id: RefId,
    module: ModuleId,
    user_id: UserId,
    operation: &str,
  ) -> Result<bool, Error>;

  /// End `operation` on a lock. With `remove` set the lock is deleted,
  /// otherwise only the mark is cleared. Returns whether the operation still
  /// held the lock.
  async fn finish_claim(
    &self,
    ref_id: RefId,
    module: ModuleId,
    operation: &str,
    remove: bool,
  ) -> Result<bool, Error>;

  /// List every lock.
  async fn list_locks(&self) -> Result<Vec<WorkflowLock>, Error>;

  /// Record a signature outside of a transition.
  async fn add_signature(&self, signature: &NewSignature) -> Result<SignatureId, Error>;

  /// Signatures recorded for a case, oldest first.
  async fn list_signatures(&self, ref_id: RefId, module: ModuleId) -> Result<Vec<Signature>, Error>;

  /// Returns / RWOAs recorded for a case, oldest first.
  async fn list_returns(&self, ref_id: RefId, module: ModuleId) -> Result<Vec<ReturnRecord>, Error>;
}
