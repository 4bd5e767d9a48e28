use serde::{Deserialize, Serialize};

use crate::ids::{OptionId, StatusId};
use crate::workflow::{
  StatusAction, StatusOption, StatusRule, StatusValidation, Status, Workflow,
};

/// A complete workflow definition as configured by an administrator.
///
/// This is the document form used for import/export. It is turned into a
/// validated `StatusGraph` before the engine will run cases against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
  pub workflow: Workflow,
  #[serde(default)]
  pub statuses: Vec<Status>,
  #[serde(default)]
  pub options: Vec<StatusOption>,
  #[serde(default)]
  pub actions: Vec<StatusAction>,
  #[serde(default)]
  pub rules: Vec<StatusRule>,
  #[serde(default)]
  pub validations: Vec<StatusValidation>,
}

impl WorkflowDefinition {
  /// A definition with no statuses yet.
  pub fn empty(workflow: Workflow) -> Self {
    Self {
      workflow,
      statuses: Vec::new(),
      options: Vec::new(),
      actions: Vec::new(),
      rules: Vec::new(),
      validations: Vec::new(),
    }
  }

  pub fn status(&self, status_id: StatusId) -> Option<&Status> {
    self.statuses.iter().find(|s| s.status_id == status_id)
  }

  pub fn option(&self, option_id: OptionId) -> Option<&StatusOption> {
    self.options.iter().find(|o| o.option_id == option_id)
  }
}
