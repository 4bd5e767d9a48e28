//! Status tracking (the audit trail).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ect_config::{ModuleId, RefId, StatusId, TrackingId};
use ect_store::{StatusTracking, Store, TrackingClose, TrackingOpen};
use tracing::debug;

use crate::context::Actor;
use crate::error::EngineError;

pub struct AuditTracker {
  store: Arc<dyn Store>,
}

impl AuditTracker {
  pub fn new(store: Arc<dyn Store>) -> Self {
    Self { store }
  }

  /// Open a tracking row. Fails while the case has another open row.
  pub async fn open(
    &self,
    ref_id: RefId,
    module: ModuleId,
    status_id: StatusId,
    actor: &Actor,
  ) -> Result<TrackingId, EngineError> {
    let tracking_id = self
      .store
      .open_tracking(&TrackingOpen {
        ref_id,
        module,
        status_id,
        started_at: Utc::now(),
        started_by: actor.user_id,
      })
      .await?;
    debug!(ref_id = %ref_id, module = %module, status_id = %status_id, tracking_id = %tracking_id, "tracking opened");
    Ok(tracking_id)
  }

  /// Close a tracking row. Closed rows are never modified again.
  pub async fn close(
    &self,
    tracking_id: TrackingId,
    actor: &Actor,
    ended_at: DateTime<Utc>,
  ) -> Result<(), EngineError> {
    self
      .store
      .close_tracking(&TrackingClose {
        tracking_id,
        ended_at,
        completed_by: actor.user_id,
        completed_by_name: actor.name_rank(),
      })
      .await?;
    debug!(tracking_id = %tracking_id, "tracking closed");
    Ok(())
  }

  pub async fn current(
    &self,
    ref_id: RefId,
    module: ModuleId,
  ) -> Result<Option<StatusTracking>, EngineError> {
    Ok(self.store.current_tracking(ref_id, module).await?)
  }

  /// Tracking rows for a reference, oldest first.
  pub async fn history(
    &self,
    ref_id: RefId,
    module: Option<ModuleId>,
  ) -> Result<Vec<StatusTracking>, EngineError> {
    Ok(self.store.tracking_history(ref_id, module).await?)
  }

  /// The close/open pair that moves a case off `current`.
  ///
  /// `to = None` closes without opening, which completes the case.
  pub fn stage_move(
    current: &StatusTracking,
    to: Option<StatusId>,
    actor: &Actor,
    now: DateTime<Utc>,
  ) -> (TrackingClose, Option<TrackingOpen>) {
    let close = TrackingClose {
      tracking_id: current.tracking_id,
      ended_at: now,
      completed_by: actor.user_id,
      completed_by_name: actor.name_rank(),
    };
    let open = to.map(|status_id| TrackingOpen {
      ref_id: current.ref_id,
      module: current.module,
      status_id,
      started_at: now,
      started_by: actor.user_id,
    });
    (close, open)
  }
}
