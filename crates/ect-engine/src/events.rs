//! Engine events and notifiers.
//!
//! Events are emitted after a change commits so consumers can send mail,
//! refresh boards, etc. Delivery is up to the notifier.

use ect_config::{ModuleId, OptionId, RefId, StatusId, UserId, WorkflowId};
use ect_store::ReturnKind;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
  /// A case entered its workflow's initial status.
  CaseStarted {
    ref_id: RefId,
    module: ModuleId,
    workflow_id: WorkflowId,
    status_id: StatusId,
    user_id: UserId,
  },

  /// A case moved along an option. `to` is `None` when the case completed.
  Transitioned {
    ref_id: RefId,
    module: ModuleId,
    option_id: OptionId,
    from: StatusId,
    to: Option<StatusId>,
    user_id: UserId,
  },

  /// A case was sent back.
  Returned {
    ref_id: RefId,
    module: ModuleId,
    kind: ReturnKind,
    from: StatusId,
    to: StatusId,
    rerouting: bool,
    user_id: UserId,
  },

  /// A `notify_group` action fired.
  GroupNotified {
    ref_id: RefId,
    module: ModuleId,
    option_id: OptionId,
    group: String,
  },

  /// An administrator removed someone's lock.
  LockCleared {
    ref_id: RefId,
    module: ModuleId,
    held_by: UserId,
  },
}

/// Receives engine events.
pub trait EngineNotifier: Send + Sync {
  fn notify(&self, event: EngineEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl EngineNotifier for NoopNotifier {
  fn notify(&self, _event: EngineEvent) {}
}

/// Sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<EngineEvent>) -> Self {
    Self { sender }
  }
}

impl EngineNotifier for ChannelNotifier {
  fn notify(&self, event: EngineEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
