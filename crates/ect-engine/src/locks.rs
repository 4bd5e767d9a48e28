//! Case locks.
//!
//! All lock mutation goes through [`LockManager`]. Acquisition never waits:
//! a second user gets the current holder back instead.
//!
//! Engine operations take the lock through [`LockManager::begin_operation`],
//! which marks the lock row with a per-operation token. A lock a user took
//! explicitly is re-entrant for that user, but only one operation can work a
//! case at a time, whoever asks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ect_config::{ModuleId, RefId, UserId};
use ect_store::{Store, WorkflowLock};
use serde::Serialize;
use tracing::{info, warn};

use crate::context::Actor;
use crate::error::EngineError;

/// Result of a lock attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
  /// The caller holds the lock. `reentrant` is set when it already did.
  Acquired { lock: WorkflowLock, reentrant: bool },
  /// Someone else holds it.
  Conflict {
    held_by: String,
    held_by_id: UserId,
    since: DateTime<Utc>,
  },
}

/// An engine operation's exclusive hold on a case, from
/// [`LockManager::begin_operation`] to [`LockManager::end_operation`].
#[derive(Debug)]
pub(crate) struct OperationClaim {
  ref_id: RefId,
  module: ModuleId,
  token: String,
  /// The lock was taken for this operation and goes away with it.
  acquired: bool,
}

/// A lock as reported to administrators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockInfo {
  #[serde(flatten)]
  pub lock: WorkflowLock,
  pub age_secs: i64,
  pub stale: bool,
}

pub struct LockManager {
  store: Arc<dyn Store>,
  stale_after: Duration,
}

impl LockManager {
  pub fn new(store: Arc<dyn Store>, stale_after: Duration) -> Self {
    Self { store, stale_after }
  }

  pub fn stale_after(&self) -> Duration {
    self.stale_after
  }

  /// Try to take the lock on a case.
  ///
  /// Re-acquiring your own lock succeeds unless an operation is working the
  /// case under it.
  pub async fn try_acquire(
    &self,
    ref_id: RefId,
    module: ModuleId,
    actor: &Actor,
  ) -> Result<LockOutcome, EngineError> {
    if let Some(existing) = self.store.get_lock(ref_id, module).await?
      && existing.user_id == actor.user_id
    {
      if existing.operation.is_some() {
        return Ok(conflict(existing, actor));
      }
      return Ok(LockOutcome::Acquired {
        lock: existing,
        reentrant: true,
      });
    }

    let held = self
      .store
      .try_insert_lock(&wanted(ref_id, module, actor, None))
      .await?;
    if held.user_id != actor.user_id {
      return Ok(conflict(held, actor));
    }

    Ok(LockOutcome::Acquired {
      lock: held,
      reentrant: false,
    })
  }

  /// Take exclusive hold of a case for one engine operation.
  ///
  /// A free case is locked for the operation alone. A lock the actor already
  /// holds is marked busy for the operation's lifetime. Anything else,
  /// including a second operation by the same actor, is `Locked`.
  pub(crate) async fn begin_operation(
    &self,
    ref_id: RefId,
    module: ModuleId,
    actor: &Actor,
  ) -> Result<OperationClaim, EngineError> {
    let token = uuid::Uuid::new_v4().to_string();
    let held = self
      .store
      .try_insert_lock(&wanted(ref_id, module, actor, Some(token.clone())))
      .await?;

    let acquired = if held.operation.as_deref() == Some(token.as_str()) {
      true
    } else if held.user_id == actor.user_id
      && held.operation.is_none()
      && self
        .store
        .claim_lock(ref_id, module, actor.user_id, &token)
        .await?
    {
      false
    } else {
      log_conflict(&held, actor);
      return Err(EngineError::Locked {
        ref_id,
        module,
        held_by: held.user_name,
        held_by_id: held.user_id,
        since: held.acquired_at,
      });
    };

    Ok(OperationClaim {
      ref_id,
      module,
      token,
      acquired,
    })
  }

  /// Give up an operation's hold. A lock the actor held beforehand stays.
  pub(crate) async fn end_operation(&self, claim: OperationClaim) {
    match self
      .store
      .finish_claim(claim.ref_id, claim.module, &claim.token, claim.acquired)
      .await
    {
      Ok(true) => {}
      Ok(false) => warn!(
        ref_id = %claim.ref_id,
        module = %claim.module,
        "operation lock was cleared while in flight"
      ),
      Err(e) => warn!(
        ref_id = %claim.ref_id,
        module = %claim.module,
        error = %e,
        "failed to release case lock"
      ),
    }
  }

  /// Release a lock held by `user_id`. Returns whether a lock was removed.
  pub async fn release(
    &self,
    ref_id: RefId,
    module: ModuleId,
    user_id: UserId,
  ) -> Result<bool, EngineError> {
    if let Some(lock) = self.store.get_lock(ref_id, module).await?
      && lock.user_id == user_id
      && lock.operation.is_some()
    {
      warn!(
        ref_id = %ref_id,
        module = %module,
        user_id = %user_id,
        "release ignored, an operation is in flight"
      );
      return Ok(false);
    }
    let removed = self.store.delete_lock(ref_id, module, Some(user_id)).await?;
    if !removed {
      warn!(
        ref_id = %ref_id,
        module = %module,
        user_id = %user_id,
        "release ignored, lock not held by user"
      );
    }
    Ok(removed)
  }

  /// Every lock with its age and staleness.
  pub async fn list_all(&self) -> Result<Vec<LockInfo>, EngineError> {
    let now = Utc::now();
    let locks = self.store.list_locks().await?;
    Ok(
      locks
        .into_iter()
        .map(|lock| {
          let stale = is_older_than(&lock, now, self.stale_after);
          LockInfo {
            age_secs: lock.age(now).num_seconds(),
            stale,
            lock,
          }
        })
        .collect(),
    )
  }

  /// Remove a lock regardless of holder. Returns the lock that was cleared.
  pub async fn force_clear(
    &self,
    ref_id: RefId,
    module: ModuleId,
  ) -> Result<Option<WorkflowLock>, EngineError> {
    let Some(lock) = self.store.get_lock(ref_id, module).await? else {
      return Ok(None);
    };
    if !self.store.delete_lock(ref_id, module, Some(lock.user_id)).await? {
      return Ok(None);
    }
    warn!(
      ref_id = %ref_id,
      module = %module,
      held_by = %lock.user_name,
      "lock force cleared"
    );
    Ok(Some(lock))
  }

  /// Remove every lock older than `max_age`.
  pub async fn clear_stale(&self, max_age: Duration) -> Result<Vec<WorkflowLock>, EngineError> {
    let now = Utc::now();
    let mut cleared = Vec::new();
    for lock in self.store.list_locks().await? {
      if !is_older_than(&lock, now, max_age) {
        continue;
      }
      if self
        .store
        .delete_lock(lock.ref_id, lock.module, Some(lock.user_id))
        .await?
      {
        warn!(
          ref_id = %lock.ref_id,
          module = %lock.module,
          held_by = %lock.user_name,
          "stale lock cleared"
        );
        cleared.push(lock);
      }
    }
    Ok(cleared)
  }
}

fn wanted(
  ref_id: RefId,
  module: ModuleId,
  actor: &Actor,
  operation: Option<String>,
) -> WorkflowLock {
  WorkflowLock {
    ref_id,
    module,
    user_id: actor.user_id,
    user_name: actor.name_rank(),
    acquired_at: Utc::now(),
    operation,
  }
}

fn conflict(held: WorkflowLock, actor: &Actor) -> LockOutcome {
  log_conflict(&held, actor);
  LockOutcome::Conflict {
    held_by: held.user_name,
    held_by_id: held.user_id,
    since: held.acquired_at,
  }
}

fn log_conflict(held: &WorkflowLock, actor: &Actor) {
  info!(
    ref_id = %held.ref_id,
    module = %held.module,
    user_id = %actor.user_id,
    held_by = %held.user_name,
    busy = held.operation.is_some(),
    "lock conflict"
  );
}

fn is_older_than(lock: &WorkflowLock, now: DateTime<Utc>, max_age: Duration) -> bool {
  lock
    .age(now)
    .to_std()
    .map(|age| age >= max_age)
    .unwrap_or(false)
}
