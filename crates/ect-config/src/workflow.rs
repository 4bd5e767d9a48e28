use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::enums::Compo;
use crate::ids::{
  ActionId, ModuleId, OptionId, RuleId, StatusId, ValidationId, WorkflowId,
};

fn default_true() -> bool {
  true
}

/// A state machine scoped to (module, component, formal/informal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
  pub workflow_id: WorkflowId,
  pub module: ModuleId,
  pub compo: Compo,
  #[serde(default)]
  pub formal: bool,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub initial_status: Option<StatusId>,
  #[serde(default = "default_true")]
  pub active: bool,
}

/// A review stage owned by exactly one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
  pub status_id: StatusId,
  pub workflow_id: WorkflowId,
  pub description: String,
  /// Per-component display labels. Falls back to `description`.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub labels: BTreeMap<Compo, String>,
  #[serde(default)]
  pub sort_order: i32,
  #[serde(default)]
  pub is_board: bool,
  /// Suspends automatic progression; the case only leaves through an explicit option.
  #[serde(default)]
  pub is_holding: bool,
  /// Subject-matter-expert consults are allowed without leaving the status.
  #[serde(default)]
  pub is_consult: bool,
  /// Group that works cases sitting at this status.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub owner_group: Option<String>,
}

impl Status {
  /// Display label for the given component.
  pub fn label_for(&self, compo: Compo) -> &str {
    self
      .labels
      .get(&compo)
      .map(String::as_str)
      .unwrap_or(&self.description)
  }
}

/// A user-selectable transition out of a status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusOption {
  pub option_id: OptionId,
  /// The status this option leaves from.
  pub status_id: StatusId,
  /// Destination status. `None` marks a terminal option.
  #[serde(default)]
  pub target: Option<StatusId>,
  pub text: String,
  #[serde(default = "default_true")]
  pub active: bool,
  #[serde(default)]
  pub sort_order: i32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub template_id: Option<i64>,
  /// AND semantics over the option's rules when set, OR otherwise.
  #[serde(default)]
  pub check_all: bool,
  /// The target lives in another workflow (e.g. promotion to appeal).
  #[serde(default)]
  pub cross_workflow: bool,
  /// Components this option is offered to. Empty means all.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub compos: Vec<Compo>,
}

impl StatusOption {
  pub fn is_terminal(&self) -> bool {
    self.target.is_none()
  }

  pub fn visible_to(&self, compo: Compo) -> bool {
    self.compos.is_empty() || self.compos.contains(&compo)
  }
}

/// A side effect executed when an option fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusAction {
  pub action_id: ActionId,
  pub option_id: OptionId,
  pub action_type: String,
  #[serde(default)]
  pub sort_order: i32,
  #[serde(default)]
  pub data: serde_json::Value,
}

/// A precondition attached to an option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRule {
  pub rule_id: RuleId,
  pub option_id: OptionId,
  pub rule_type: String,
  #[serde(default)]
  pub data: serde_json::Value,
}

/// A precondition attached to a status, checked whichever option is chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusValidation {
  pub validation_id: ValidationId,
  pub status_id: StatusId,
  pub validation_type: String,
  #[serde(default)]
  pub data: serde_json::Value,
  #[serde(default = "default_true")]
  pub active: bool,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_option_defaults() {
    let option: StatusOption = serde_json::from_value(json!({
      "option_id": 1,
      "status_id": 10,
      "target": 11,
      "text": "Forward to Board"
    }))
    .unwrap();

    assert!(option.active);
    assert!(!option.check_all);
    assert!(!option.cross_workflow);
    assert!(!option.is_terminal());
    assert!(option.visible_to(Compo::Guard));
  }

  #[test]
  fn test_option_compo_filter() {
    let option: StatusOption = serde_json::from_value(json!({
      "option_id": 1,
      "status_id": 10,
      "text": "Close",
      "compos": ["reserve"]
    }))
    .unwrap();

    assert!(option.is_terminal());
    assert!(option.visible_to(Compo::Reserve));
    assert!(!option.visible_to(Compo::Active));
  }

  #[test]
  fn test_status_label_fallback() {
    let status: Status = serde_json::from_value(json!({
      "status_id": 10,
      "workflow_id": 1,
      "description": "Medical Officer Review",
      "labels": { "guard": "MO Review (ANG)" }
    }))
    .unwrap();

    assert_eq!(status.label_for(Compo::Guard), "MO Review (ANG)");
    assert_eq!(status.label_for(Compo::Active), "Medical Officer Review");
  }
}
