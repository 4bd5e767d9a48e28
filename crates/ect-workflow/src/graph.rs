use std::collections::{HashMap, HashSet};

use ect_config::{
  Compo, OptionId, Status, StatusAction, StatusId, StatusOption, StatusRule, StatusValidation,
  Workflow, WorkflowDefinition,
};

use crate::error::WorkflowError;

/// A validated status graph for one workflow.
///
/// Statuses, options, actions, rules and validations live in flat arenas and
/// are addressed by their ids through index maps. Adjacency is kept as lists
/// of arena indices, so there are no references between records.
#[derive(Debug, Clone)]
pub struct StatusGraph {
  workflow: Workflow,
  statuses: Vec<Status>,
  options: Vec<StatusOption>,
  actions: Vec<StatusAction>,
  rules: Vec<StatusRule>,
  validations: Vec<StatusValidation>,
  status_index: HashMap<StatusId, usize>,
  option_index: HashMap<OptionId, usize>,
  /// status arena index -> outgoing option indices, in display order.
  outgoing: Vec<Vec<usize>>,
  /// option arena index -> action indices, in execution order.
  option_actions: Vec<Vec<usize>>,
  /// option arena index -> rule indices.
  option_rules: Vec<Vec<usize>>,
  /// status arena index -> validation indices.
  status_validations: Vec<Vec<usize>>,
}

impl StatusGraph {
  /// Validate a definition and build the graph.
  pub fn build(def: WorkflowDefinition) -> Result<Self, WorkflowError> {
    let WorkflowDefinition {
      workflow,
      statuses,
      options,
      actions,
      rules,
      validations,
    } = def;

    let mut status_index = HashMap::with_capacity(statuses.len());
    for (idx, status) in statuses.iter().enumerate() {
      if status.workflow_id != workflow.workflow_id {
        return Err(WorkflowError::ForeignStatus {
          status_id: status.status_id,
          owner: status.workflow_id,
          workflow_id: workflow.workflow_id,
        });
      }
      if status_index.insert(status.status_id, idx).is_some() {
        return Err(WorkflowError::DuplicateId {
          kind: "status",
          id: status.status_id.0,
        });
      }
    }

    if let Some(initial) = workflow.initial_status
      && !status_index.contains_key(&initial)
    {
      return Err(WorkflowError::InvalidInitialStatus {
        workflow_id: workflow.workflow_id,
        status_id: initial,
      });
    }

    let mut option_index = HashMap::with_capacity(options.len());
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); statuses.len()];
    for (idx, option) in options.iter().enumerate() {
      if option_index.insert(option.option_id, idx).is_some() {
        return Err(WorkflowError::DuplicateId {
          kind: "option",
          id: option.option_id.0,
        });
      }
      let owner = *status_index
        .get(&option.status_id)
        .ok_or(WorkflowError::OrphanOption {
          option_id: option.option_id,
          status_id: option.status_id,
        })?;
      if let Some(target) = option.target {
        let local = status_index.contains_key(&target);
        if option.cross_workflow && local {
          return Err(WorkflowError::LocalCrossWorkflowTarget {
            option_id: option.option_id,
            target,
          });
        }
        if !option.cross_workflow && !local {
          return Err(WorkflowError::InvalidTarget {
            option_id: option.option_id,
            target,
          });
        }
      }
      outgoing[owner].push(idx);
    }
    for list in &mut outgoing {
      list.sort_by_key(|&i| (options[i].sort_order, options[i].option_id));
    }

    let mut seen = HashSet::with_capacity(actions.len());
    let mut option_actions: Vec<Vec<usize>> = vec![Vec::new(); options.len()];
    for (idx, action) in actions.iter().enumerate() {
      if !seen.insert(action.action_id) {
        return Err(WorkflowError::DuplicateId {
          kind: "action",
          id: action.action_id.0,
        });
      }
      let owner = *option_index
        .get(&action.option_id)
        .ok_or(WorkflowError::OrphanAction {
          action_id: action.action_id,
          option_id: action.option_id,
        })?;
      option_actions[owner].push(idx);
    }
    for list in &mut option_actions {
      list.sort_by_key(|&i| (actions[i].sort_order, actions[i].action_id));
    }

    let mut seen = HashSet::with_capacity(rules.len());
    let mut option_rules: Vec<Vec<usize>> = vec![Vec::new(); options.len()];
    for (idx, rule) in rules.iter().enumerate() {
      if !seen.insert(rule.rule_id) {
        return Err(WorkflowError::DuplicateId {
          kind: "rule",
          id: rule.rule_id.0,
        });
      }
      let owner = *option_index
        .get(&rule.option_id)
        .ok_or(WorkflowError::OrphanRule {
          rule_id: rule.rule_id,
          option_id: rule.option_id,
        })?;
      option_rules[owner].push(idx);
    }

    let mut seen = HashSet::with_capacity(validations.len());
    let mut status_validations: Vec<Vec<usize>> = vec![Vec::new(); statuses.len()];
    for (idx, validation) in validations.iter().enumerate() {
      if !seen.insert(validation.validation_id) {
        return Err(WorkflowError::DuplicateId {
          kind: "validation",
          id: validation.validation_id.0,
        });
      }
      let owner = *status_index
        .get(&validation.status_id)
        .ok_or(WorkflowError::OrphanValidation {
          validation_id: validation.validation_id,
          status_id: validation.status_id,
        })?;
      status_validations[owner].push(idx);
    }

    Ok(Self {
      workflow,
      statuses,
      options,
      actions,
      rules,
      validations,
      status_index,
      option_index,
      outgoing,
      option_actions,
      option_rules,
      status_validations,
    })
  }

  pub fn workflow(&self) -> &Workflow {
    &self.workflow
  }

  /// Get a status by ID.
  pub fn status(&self, status_id: StatusId) -> Option<&Status> {
    self.status_index.get(&status_id).map(|&i| &self.statuses[i])
  }

  /// Get an option by ID.
  pub fn option(&self, option_id: OptionId) -> Option<&StatusOption> {
    self.option_index.get(&option_id).map(|&i| &self.options[i])
  }

  /// All statuses ordered by sort order.
  pub fn statuses(&self) -> Vec<&Status> {
    let mut statuses: Vec<&Status> = self.statuses.iter().collect();
    statuses.sort_by_key(|s| (s.sort_order, s.status_id));
    statuses
  }

  /// The status new cases start in.
  pub fn initial_status(&self) -> Result<&Status, WorkflowError> {
    let initial = self
      .workflow
      .initial_status
      .ok_or(WorkflowError::NoInitialStatus(self.workflow.workflow_id))?;
    self
      .status(initial)
      .ok_or(WorkflowError::StatusNotFound(initial))
  }

  /// Active options out of a status that the component may see, in display order.
  pub fn options_for_status(
    &self,
    status_id: StatusId,
    compo: Compo,
  ) -> Result<Vec<&StatusOption>, WorkflowError> {
    Ok(
      self
        .all_options_for_status(status_id)?
        .into_iter()
        .filter(|o| o.active && o.visible_to(compo))
        .collect(),
    )
  }

  /// Every option out of a status, including inactive ones.
  pub fn all_options_for_status(
    &self,
    status_id: StatusId,
  ) -> Result<Vec<&StatusOption>, WorkflowError> {
    let idx = *self
      .status_index
      .get(&status_id)
      .ok_or(WorkflowError::StatusNotFound(status_id))?;
    Ok(self.outgoing[idx].iter().map(|&i| &self.options[i]).collect())
  }

  /// The in-workflow status an option leads to.
  ///
  /// `None` for terminal options and cross-workflow handoffs.
  pub fn target_of(&self, option: &StatusOption) -> Option<&Status> {
    if option.cross_workflow {
      return None;
    }
    option.target.and_then(|t| self.status(t))
  }

  /// Actions attached to an option in ascending sort order.
  pub fn actions_for(&self, option_id: OptionId) -> Result<Vec<&StatusAction>, WorkflowError> {
    let idx = self.option_idx(option_id)?;
    Ok(
      self.option_actions[idx]
        .iter()
        .map(|&i| &self.actions[i])
        .collect(),
    )
  }

  /// Rules attached to an option.
  pub fn rules_for(&self, option_id: OptionId) -> Result<Vec<&StatusRule>, WorkflowError> {
    let idx = self.option_idx(option_id)?;
    Ok(self.option_rules[idx].iter().map(|&i| &self.rules[i]).collect())
  }

  /// Active validations attached to a status.
  pub fn validations_for(
    &self,
    status_id: StatusId,
  ) -> Result<Vec<&StatusValidation>, WorkflowError> {
    let idx = *self
      .status_index
      .get(&status_id)
      .ok_or(WorkflowError::StatusNotFound(status_id))?;
    Ok(
      self.status_validations[idx]
        .iter()
        .map(|&i| &self.validations[i])
        .filter(|v| v.active)
        .collect(),
    )
  }

  /// Convert back into the document form, e.g. to apply an edit and re-validate.
  pub fn to_definition(&self) -> WorkflowDefinition {
    WorkflowDefinition {
      workflow: self.workflow.clone(),
      statuses: self.statuses.clone(),
      options: self.options.clone(),
      actions: self.actions.clone(),
      rules: self.rules.clone(),
      validations: self.validations.clone(),
    }
  }

  fn option_idx(&self, option_id: OptionId) -> Result<usize, WorkflowError> {
    self
      .option_index
      .get(&option_id)
      .copied()
      .ok_or(WorkflowError::OptionNotFound(option_id))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ect_config::{ActionId, ModuleId, RuleId, ValidationId, WorkflowId};
  use serde_json::json;

  fn status(id: i64, sort_order: i32) -> Status {
    Status {
      status_id: StatusId(id),
      workflow_id: WorkflowId(1),
      description: format!("status {}", id),
      labels: Default::default(),
      sort_order,
      is_board: false,
      is_holding: false,
      is_consult: false,
      owner_group: None,
    }
  }

  fn option(id: i64, from: i64, to: Option<i64>, sort_order: i32) -> StatusOption {
    StatusOption {
      option_id: OptionId(id),
      status_id: StatusId(from),
      target: to.map(StatusId),
      text: format!("option {}", id),
      active: true,
      sort_order,
      template_id: None,
      check_all: false,
      cross_workflow: false,
      compos: vec![],
    }
  }

  fn definition() -> WorkflowDefinition {
    WorkflowDefinition {
      workflow: Workflow {
        workflow_id: WorkflowId(1),
        module: ModuleId(2),
        compo: Compo::Active,
        formal: false,
        title: "Informal LOD".to_string(),
        initial_status: Some(StatusId(10)),
        active: true,
      },
      statuses: vec![status(10, 1), status(11, 2), status(12, 3)],
      options: vec![
        option(100, 10, Some(12), 2),
        option(101, 10, Some(11), 1),
        option(102, 11, None, 1),
      ],
      actions: vec![
        StatusAction {
          action_id: ActionId(2),
          option_id: OptionId(100),
          action_type: "set_field".to_string(),
          sort_order: 5,
          data: json!({}),
        },
        StatusAction {
          action_id: ActionId(1),
          option_id: OptionId(100),
          action_type: "add_signature".to_string(),
          sort_order: 1,
          data: json!({}),
        },
      ],
      rules: vec![StatusRule {
        rule_id: RuleId(1),
        option_id: OptionId(100),
        rule_type: "require_field".to_string(),
        data: json!({ "field": "x" }),
      }],
      validations: vec![
        StatusValidation {
          validation_id: ValidationId(1),
          status_id: StatusId(10),
          validation_type: "require_field".to_string(),
          data: json!({ "field": "y" }),
          active: true,
        },
        StatusValidation {
          validation_id: ValidationId(2),
          status_id: StatusId(10),
          validation_type: "require_field".to_string(),
          data: json!({ "field": "z" }),
          active: false,
        },
      ],
    }
  }

  #[test]
  fn test_build_and_query() {
    let graph = StatusGraph::build(definition()).unwrap();

    assert_eq!(graph.initial_status().unwrap().status_id, StatusId(10));

    let options = graph.options_for_status(StatusId(10), Compo::Active).unwrap();
    let ids: Vec<_> = options.iter().map(|o| o.option_id).collect();
    assert_eq!(ids, vec![OptionId(101), OptionId(100)]);

    let target = graph.target_of(options[0]).unwrap();
    assert_eq!(target.status_id, StatusId(11));

    let actions = graph.actions_for(OptionId(100)).unwrap();
    let ids: Vec<_> = actions.iter().map(|a| a.action_id).collect();
    assert_eq!(ids, vec![ActionId(1), ActionId(2)]);

    assert_eq!(graph.rules_for(OptionId(100)).unwrap().len(), 1);
    assert_eq!(graph.validations_for(StatusId(10)).unwrap().len(), 1);
  }

  #[test]
  fn test_inactive_and_hidden_options_are_filtered() {
    let mut def = definition();
    def.options[0].active = false;
    def.options[1].compos = vec![Compo::Guard];
    let graph = StatusGraph::build(def).unwrap();

    assert!(graph
      .options_for_status(StatusId(10), Compo::Active)
      .unwrap()
      .is_empty());
    assert_eq!(
      graph
        .options_for_status(StatusId(10), Compo::Guard)
        .unwrap()
        .len(),
      1
    );
    assert_eq!(graph.all_options_for_status(StatusId(10)).unwrap().len(), 2);
  }

  #[test]
  fn test_unknown_status_is_not_found() {
    let graph = StatusGraph::build(definition()).unwrap();
    assert!(matches!(
      graph.options_for_status(StatusId(99), Compo::Active),
      Err(WorkflowError::StatusNotFound(StatusId(99)))
    ));
  }

  #[test]
  fn test_missing_initial_status() {
    let mut def = definition();
    def.workflow.initial_status = None;
    let graph = StatusGraph::build(def).unwrap();
    assert!(matches!(
      graph.initial_status(),
      Err(WorkflowError::NoInitialStatus(_))
    ));
  }

  #[test]
  fn test_rejects_unflagged_foreign_target() {
    let mut def = definition();
    def.options.push(option(103, 11, Some(500), 2));
    assert!(matches!(
      StatusGraph::build(def),
      Err(WorkflowError::InvalidTarget { .. })
    ));
  }

  #[test]
  fn test_accepts_flagged_cross_workflow_target() {
    let mut def = definition();
    let mut handoff = option(103, 11, Some(500), 2);
    handoff.cross_workflow = true;
    def.options.push(handoff);

    let graph = StatusGraph::build(def).unwrap();
    let handoff = graph.option(OptionId(103)).unwrap();
    assert!(graph.target_of(handoff).is_none());
    assert!(!handoff.is_terminal());
  }

  #[test]
  fn test_rejects_cross_workflow_flag_on_local_target() {
    let mut def = definition();
    def.options[0].cross_workflow = true;
    assert!(matches!(
      StatusGraph::build(def),
      Err(WorkflowError::LocalCrossWorkflowTarget { .. })
    ));
  }

  #[test]
  fn test_rejects_structural_errors() {
    let mut def = definition();
    def.statuses.push(status(10, 9));
    assert!(matches!(
      StatusGraph::build(def),
      Err(WorkflowError::DuplicateId { kind: "status", .. })
    ));

    let mut def = definition();
    def.options.push(option(104, 77, None, 0));
    assert!(matches!(
      StatusGraph::build(def),
      Err(WorkflowError::OrphanOption { .. })
    ));

    let mut def = definition();
    def.rules[0].option_id = OptionId(999);
    assert!(matches!(
      StatusGraph::build(def),
      Err(WorkflowError::OrphanRule { .. })
    ));

    let mut def = definition();
    def.workflow.initial_status = Some(StatusId(999));
    assert!(matches!(
      StatusGraph::build(def),
      Err(WorkflowError::InvalidInitialStatus { .. })
    ));

    let mut def = definition();
    def.statuses[1].workflow_id = WorkflowId(2);
    assert!(matches!(
      StatusGraph::build(def),
      Err(WorkflowError::ForeignStatus { .. })
    ));
  }

  #[test]
  fn test_definition_roundtrip_keeps_records() {
    let graph = StatusGraph::build(definition()).unwrap();
    let def = graph.to_definition();
    assert_eq!(def.statuses.len(), 3);
    assert_eq!(def.options.len(), 3);
    assert_eq!(def.validations.len(), 2);
  }
}
