//! Response shapes for the call surface.

use chrono::{DateTime, Utc};
use ect_config::{
  Compo, ModuleId, OptionId, RefId, Status, StatusId, StatusOption, TrackingId, UserId,
};
use ect_store::StatusTracking;
use ect_workflow::StatusGraph;
use serde::Serialize;

/// A workflow step: one option out of a status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepView {
  pub option_id: OptionId,
  pub status_id: StatusId,
  pub status: String,
  pub text: String,
  pub target: Option<StatusId>,
  /// Label of the target when it is in the same workflow.
  pub target_status: Option<String>,
  pub active: bool,
  pub sort_order: i32,
  pub check_all: bool,
  pub cross_workflow: bool,
  pub terminal: bool,
}

impl StepView {
  pub(crate) fn new(graph: &StatusGraph, option: &StatusOption, compo: Compo) -> Self {
    let label = |status: &Status| status.label_for(compo).to_string();
    Self {
      option_id: option.option_id,
      status_id: option.status_id,
      status: graph.status(option.status_id).map(label).unwrap_or_default(),
      text: option.text.clone(),
      target: option.target,
      target_status: graph.target_of(option).map(label),
      active: option.active,
      sort_order: option.sort_order,
      check_all: option.check_all,
      cross_workflow: option.cross_workflow,
      terminal: option.is_terminal(),
    }
  }
}

/// One tracking row with the status description resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkstatusView {
  pub tracking_id: TrackingId,
  pub ref_id: RefId,
  pub module: ModuleId,
  pub status_id: StatusId,
  pub status: String,
  pub started_at: DateTime<Utc>,
  pub started_by: UserId,
  pub ended_at: Option<DateTime<Utc>>,
  pub completed_by: Option<UserId>,
  pub completed_by_name: Option<String>,
}

impl WorkstatusView {
  pub(crate) fn new(row: StatusTracking, status: String) -> Self {
    Self {
      tracking_id: row.tracking_id,
      ref_id: row.ref_id,
      module: row.module,
      status_id: row.status_id,
      status,
      started_at: row.started_at,
      started_by: row.started_by,
      ended_at: row.ended_at,
      completed_by: row.completed_by,
      completed_by_name: row.completed_by_name,
    }
  }
}
