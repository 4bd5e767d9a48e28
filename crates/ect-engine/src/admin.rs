//! Workflow administration.
//!
//! Definition edits load the whole workflow, apply the change, rebuild the
//! graph to validate it and save it back in one store call. Edits are
//! serialized against each other; they never take case locks. A status that
//! an open case sits in cannot be removed.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use ect_config::{
  ActionId, Compo, OptionId, RuleId, Status, StatusAction, StatusId, StatusOption,
  StatusRule, StatusValidation, ValidationId, Workflow, WorkflowDefinition, WorkflowId,
};
use ect_store::IdSpace;
use ect_workflow::StatusGraph;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::Engine;
use crate::error::EngineError;

fn default_true() -> bool {
  true
}

/// A status to add to a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStatus {
  pub workflow_id: WorkflowId,
  pub description: String,
  #[serde(default)]
  pub labels: std::collections::BTreeMap<Compo, String>,
  #[serde(default)]
  pub sort_order: i32,
  #[serde(default)]
  pub is_board: bool,
  #[serde(default)]
  pub is_holding: bool,
  #[serde(default)]
  pub is_consult: bool,
  #[serde(default)]
  pub owner_group: Option<String>,
  /// Make this the workflow's initial status.
  #[serde(default)]
  pub initial: bool,
}

/// An option to add to a status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOption {
  pub status_id: StatusId,
  #[serde(default)]
  pub target: Option<StatusId>,
  pub text: String,
  #[serde(default = "default_true")]
  pub active: bool,
  #[serde(default)]
  pub sort_order: i32,
  #[serde(default)]
  pub template_id: Option<i64>,
  #[serde(default)]
  pub check_all: bool,
  #[serde(default)]
  pub cross_workflow: bool,
  #[serde(default)]
  pub compos: Vec<Compo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAction {
  pub option_id: OptionId,
  pub action_type: String,
  #[serde(default)]
  pub sort_order: i32,
  #[serde(default)]
  pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
  pub option_id: OptionId,
  pub rule_type: String,
  #[serde(default)]
  pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewValidation {
  pub status_id: StatusId,
  pub validation_type: String,
  #[serde(default)]
  pub data: Value,
  #[serde(default = "default_true")]
  pub active: bool,
}

fn remap<K>(map: &HashMap<K, K>, key: K, kind: &str) -> Result<K, EngineError>
where
  K: Copy + Eq + Hash + std::fmt::Display,
{
  map
    .get(&key)
    .copied()
    .ok_or_else(|| EngineError::invalid_definition(format!("{} {} has no copy", kind, key)))
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), EngineError> {
  if cancel.is_cancelled() {
    return Err(EngineError::Cancelled);
  }
  Ok(())
}

impl Engine {
  /// Create an empty workflow header, e.g. as the target of a copy.
  pub async fn create_workflow(
    &self,
    workflow: Workflow,
    cancel: &CancellationToken,
  ) -> Result<Workflow, EngineError> {
    check_cancelled(cancel)?;
    if workflow.initial_status.is_some() {
      return Err(EngineError::invalid_request(
        "a new workflow has no statuses to start in",
      ));
    }
    let _guard = self.definition_guard().await;
    self
      .store
      .create_workflow(&workflow)
      .await
      .map_err(|e| match e {
        ect_store::Error::Conflict(message) => EngineError::InvalidRequest { message },
        other => other.into(),
      })?;
    info!(workflow_id = %workflow.workflow_id, title = %workflow.title, "workflow created");
    Ok(workflow)
  }

  /// Replace a workflow with a definition document.
  pub async fn import_definition(
    &self,
    definition: WorkflowDefinition,
    cancel: &CancellationToken,
  ) -> Result<Arc<StatusGraph>, EngineError> {
    check_cancelled(cancel)?;
    let _guard = self.definition_guard().await;
    let graph = self.save_validated(definition).await?;
    info!(
      workflow_id = %graph.workflow().workflow_id,
      statuses = graph.statuses().len(),
      "workflow definition imported"
    );
    Ok(graph)
  }

  /// Add a status to a workflow.
  pub async fn insert_workstatus(
    &self,
    new: NewStatus,
    cancel: &CancellationToken,
  ) -> Result<Status, EngineError> {
    check_cancelled(cancel)?;
    let _guard = self.definition_guard().await;
    let mut def = self.store.load_definition(new.workflow_id).await?;

    let status = Status {
      status_id: StatusId(self.store.next_id(IdSpace::Status).await?),
      workflow_id: new.workflow_id,
      description: new.description,
      labels: new.labels,
      sort_order: new.sort_order,
      is_board: new.is_board,
      is_holding: new.is_holding,
      is_consult: new.is_consult,
      owner_group: new.owner_group,
    };
    def.statuses.push(status.clone());
    if new.initial {
      def.workflow.initial_status = Some(status.status_id);
    }

    check_cancelled(cancel)?;
    self.save_validated(def).await?;
    info!(workflow_id = %status.workflow_id, status_id = %status.status_id, "status inserted");
    Ok(status)
  }

  /// Replace a status's attributes. A status cannot move between workflows.
  pub async fn update_workstatus(
    &self,
    status: Status,
    cancel: &CancellationToken,
  ) -> Result<Status, EngineError> {
    check_cancelled(cancel)?;
    let _guard = self.definition_guard().await;
    let existing = self.store.find_status(status.status_id).await?;
    if existing.workflow_id != status.workflow_id {
      return Err(EngineError::invalid_request(format!(
        "status {} belongs to workflow {}",
        status.status_id, existing.workflow_id
      )));
    }

    let mut def = self.store.load_definition(status.workflow_id).await?;
    let slot = def
      .statuses
      .iter_mut()
      .find(|s| s.status_id == status.status_id)
      .ok_or_else(|| EngineError::not_found(format!("status {}", status.status_id)))?;
    *slot = status.clone();

    check_cancelled(cancel)?;
    self.save_validated(def).await?;
    info!(workflow_id = %status.workflow_id, status_id = %status.status_id, "status updated");
    Ok(status)
  }

  /// Add an option out of a status.
  pub async fn insert_option(
    &self,
    new: NewOption,
    cancel: &CancellationToken,
  ) -> Result<StatusOption, EngineError> {
    check_cancelled(cancel)?;
    let _guard = self.definition_guard().await;
    let workflow_id = self.store.find_status(new.status_id).await?.workflow_id;
    let mut def = self.store.load_definition(workflow_id).await?;

    let option = StatusOption {
      option_id: OptionId(self.store.next_id(IdSpace::Option).await?),
      status_id: new.status_id,
      target: new.target,
      text: new.text,
      active: new.active,
      sort_order: new.sort_order,
      template_id: new.template_id,
      check_all: new.check_all,
      cross_workflow: new.cross_workflow,
      compos: new.compos,
    };
    def.options.push(option.clone());

    check_cancelled(cancel)?;
    self.save_validated(def).await?;
    info!(workflow_id = %workflow_id, option_id = %option.option_id, "option inserted");
    Ok(option)
  }

  /// Attach an action to an option.
  pub async fn insert_action(
    &self,
    new: NewAction,
    cancel: &CancellationToken,
  ) -> Result<StatusAction, EngineError> {
    check_cancelled(cancel)?;
    let _guard = self.definition_guard().await;
    let workflow_id = self.workflow_of_option(new.option_id).await?;
    let mut def = self.store.load_definition(workflow_id).await?;

    let action = StatusAction {
      action_id: ActionId(self.store.next_id(IdSpace::Action).await?),
      option_id: new.option_id,
      action_type: new.action_type,
      sort_order: new.sort_order,
      data: new.data,
    };
    def.actions.push(action.clone());

    check_cancelled(cancel)?;
    self.save_validated(def).await?;
    info!(workflow_id = %workflow_id, action_id = %action.action_id, "action inserted");
    Ok(action)
  }

  /// Attach a rule to an option.
  pub async fn insert_rule(
    &self,
    new: NewRule,
    cancel: &CancellationToken,
  ) -> Result<StatusRule, EngineError> {
    check_cancelled(cancel)?;
    let _guard = self.definition_guard().await;
    let workflow_id = self.workflow_of_option(new.option_id).await?;
    let mut def = self.store.load_definition(workflow_id).await?;

    let rule = StatusRule {
      rule_id: RuleId(self.store.next_id(IdSpace::Rule).await?),
      option_id: new.option_id,
      rule_type: new.rule_type,
      data: new.data,
    };
    def.rules.push(rule.clone());

    check_cancelled(cancel)?;
    self.save_validated(def).await?;
    info!(workflow_id = %workflow_id, rule_id = %rule.rule_id, "rule inserted");
    Ok(rule)
  }

  /// Attach a validation to a status.
  pub async fn insert_validation(
    &self,
    new: NewValidation,
    cancel: &CancellationToken,
  ) -> Result<StatusValidation, EngineError> {
    check_cancelled(cancel)?;
    let _guard = self.definition_guard().await;
    let workflow_id = self.store.find_status(new.status_id).await?.workflow_id;
    let mut def = self.store.load_definition(workflow_id).await?;

    let validation = StatusValidation {
      validation_id: ValidationId(self.store.next_id(IdSpace::Validation).await?),
      status_id: new.status_id,
      validation_type: new.validation_type,
      data: new.data,
      active: new.active,
    };
    def.validations.push(validation.clone());

    check_cancelled(cancel)?;
    self.save_validated(def).await?;
    info!(workflow_id = %workflow_id, validation_id = %validation.validation_id, "validation inserted");
    Ok(validation)
  }

  /// Copy every status, option, action, rule and validation of `from` into
  /// the empty workflow `to`.
  ///
  /// Option targets inside the source are pointed at the copies;
  /// cross-workflow targets are kept as they are.
  pub async fn copy_workflow(
    &self,
    from: WorkflowId,
    to: WorkflowId,
    cancel: &CancellationToken,
  ) -> Result<WorkflowDefinition, EngineError> {
    check_cancelled(cancel)?;
    if from == to {
      return Err(EngineError::invalid_request(
        "cannot copy a workflow onto itself",
      ));
    }
    let _guard = self.definition_guard().await;

    let source = StatusGraph::build(self.store.load_definition(from).await?)?.to_definition();
    let target = self.store.load_definition(to).await?;
    if !target.statuses.is_empty() {
      return Err(EngineError::invalid_definition(format!(
        "workflow {} already has statuses",
        to
      )));
    }

    let status_base = self.store.next_id(IdSpace::Status).await?;
    let option_base = self.store.next_id(IdSpace::Option).await?;
    let action_base = self.store.next_id(IdSpace::Action).await?;
    let rule_base = self.store.next_id(IdSpace::Rule).await?;
    let validation_base = self.store.next_id(IdSpace::Validation).await?;

    let status_map: HashMap<StatusId, StatusId> = source
      .statuses
      .iter()
      .enumerate()
      .map(|(i, s)| (s.status_id, StatusId(status_base + i as i64)))
      .collect();
    let option_map: HashMap<OptionId, OptionId> = source
      .options
      .iter()
      .enumerate()
      .map(|(i, o)| (o.option_id, OptionId(option_base + i as i64)))
      .collect();

    let mut def = WorkflowDefinition::empty(Workflow {
      initial_status: source
        .workflow
        .initial_status
        .map(|s| remap(&status_map, s, "status"))
        .transpose()?,
      ..target.workflow
    });

    for status in &source.statuses {
      def.statuses.push(Status {
        status_id: remap(&status_map, status.status_id, "status")?,
        workflow_id: to,
        ..status.clone()
      });
    }
    for option in &source.options {
      let target = match option.target {
        Some(t) if !option.cross_workflow => Some(remap(&status_map, t, "status")?),
        other => other,
      };
      def.options.push(StatusOption {
        option_id: remap(&option_map, option.option_id, "option")?,
        status_id: remap(&status_map, option.status_id, "status")?,
        target,
        ..option.clone()
      });
    }
    for (i, action) in source.actions.iter().enumerate() {
      def.actions.push(StatusAction {
        action_id: ActionId(action_base + i as i64),
        option_id: remap(&option_map, action.option_id, "option")?,
        ..action.clone()
      });
    }
    for (i, rule) in source.rules.iter().enumerate() {
      def.rules.push(StatusRule {
        rule_id: RuleId(rule_base + i as i64),
        option_id: remap(&option_map, rule.option_id, "option")?,
        ..rule.clone()
      });
    }
    for (i, validation) in source.validations.iter().enumerate() {
      def.validations.push(StatusValidation {
        validation_id: ValidationId(validation_base + i as i64),
        status_id: remap(&status_map, validation.status_id, "status")?,
        ..validation.clone()
      });
    }

    check_cancelled(cancel)?;
    let graph = self.save_validated(def).await?;
    info!(
      from = %from,
      to = %to,
      statuses = source.statuses.len(),
      options = source.options.len(),
      "workflow copied"
    );
    Ok(graph.to_definition())
  }

  /// Append copies of one option's actions onto another option.
  pub async fn copy_actions(
    &self,
    src: OptionId,
    dest: OptionId,
    cancel: &CancellationToken,
  ) -> Result<Vec<StatusAction>, EngineError> {
    check_cancelled(cancel)?;
    if src == dest {
      return Err(EngineError::invalid_request(
        "cannot copy actions onto the same option",
      ));
    }
    let _guard = self.definition_guard().await;
    let source: Vec<StatusAction> = self
      .graph_for_option(src)
      .await?
      .actions_for(src)?
      .into_iter()
      .cloned()
      .collect();

    let workflow_id = self.workflow_of_option(dest).await?;
    let mut def = self.store.load_definition(workflow_id).await?;

    let base = self.store.next_id(IdSpace::Action).await?;
    let copies: Vec<StatusAction> = source
      .into_iter()
      .enumerate()
      .map(|(i, action)| StatusAction {
        action_id: ActionId(base + i as i64),
        option_id: dest,
        ..action
      })
      .collect();
    def.actions.extend(copies.iter().cloned());

    check_cancelled(cancel)?;
    self.save_validated(def).await?;
    info!(src = %src, dest = %dest, copied = copies.len(), "actions copied");
    Ok(copies)
  }

  /// Append copies of one option's rules onto another option.
  pub async fn copy_rules(
    &self,
    src: OptionId,
    dest: OptionId,
    cancel: &CancellationToken,
  ) -> Result<Vec<StatusRule>, EngineError> {
    check_cancelled(cancel)?;
    if src == dest {
      return Err(EngineError::invalid_request(
        "cannot copy rules onto the same option",
      ));
    }
    let _guard = self.definition_guard().await;
    let source: Vec<StatusRule> = self
      .graph_for_option(src)
      .await?
      .rules_for(src)?
      .into_iter()
      .cloned()
      .collect();

    let workflow_id = self.workflow_of_option(dest).await?;
    let mut def = self.store.load_definition(workflow_id).await?;

    let base = self.store.next_id(IdSpace::Rule).await?;
    let copies: Vec<StatusRule> = source
      .into_iter()
      .enumerate()
      .map(|(i, rule)| StatusRule {
        rule_id: RuleId(base + i as i64),
        option_id: dest,
        ..rule
      })
      .collect();
    def.rules.extend(copies.iter().cloned());

    check_cancelled(cancel)?;
    self.save_validated(def).await?;
    info!(src = %src, dest = %dest, copied = copies.len(), "rules copied");
    Ok(copies)
  }

  async fn workflow_of_option(&self, option_id: OptionId) -> Result<WorkflowId, EngineError> {
    let option = self.store.find_option(option_id).await?;
    Ok(self.store.find_status(option.status_id).await?.workflow_id)
  }

  /// Validate a definition, save it and drop the cached graph.
  async fn save_validated(
    &self,
    definition: WorkflowDefinition,
  ) -> Result<Arc<StatusGraph>, EngineError> {
    for action in &definition.actions {
      if !self.actions.contains(&action.action_type) {
        return Err(EngineError::invalid_definition(format!(
          "action {} has unknown type '{}'",
          action.action_id, action.action_type
        )));
      }
    }
    for rule in &definition.rules {
      if !self.evaluator.rules().contains(&rule.rule_type) {
        return Err(EngineError::invalid_definition(format!(
          "rule {} has unknown type '{}'",
          rule.rule_id, rule.rule_type
        )));
      }
    }
    for validation in &definition.validations {
      if !self.evaluator.validations().contains(&validation.validation_type) {
        return Err(EngineError::invalid_definition(format!(
          "validation {} has unknown type '{}'",
          validation.validation_id, validation.validation_type
        )));
      }
    }

    let workflow_id = definition.workflow.workflow_id;
    let graph = StatusGraph::build(definition)?;

    let stranded: Vec<String> = self
      .store
      .live_statuses(workflow_id)
      .await?
      .into_iter()
      .filter(|id| graph.status(*id).is_none())
      .map(|id| id.to_string())
      .collect();
    if !stranded.is_empty() {
      return Err(EngineError::invalid_definition(format!(
        "workflow {} would drop status {} still holding open cases",
        workflow_id,
        stranded.join(", ")
      )));
    }

    for option in graph.to_definition().options {
      if let (true, Some(target)) = (option.cross_workflow, option.target) {
        self.store.find_status(target).await.map_err(|_| {
          EngineError::invalid_definition(format!(
            "option {} targets unknown status {}",
            option.option_id, target
          ))
        })?;
      }
    }

    self
      .store
      .save_definition(&graph.to_definition())
      .await
      .map_err(|e| match e {
        ect_store::Error::Conflict(message) => EngineError::InvalidDefinition { message },
        other => other.into(),
      })?;
    self.cache.invalidate(workflow_id).await;

    Ok(Arc::new(graph))
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use ect_config::{EngineConfig, ModuleId};
  use ect_store::{MemoryStore, Store};

  use super::*;

  fn workflow(workflow_id: i64, initial: Option<StatusId>) -> Workflow {
    Workflow {
      workflow_id: WorkflowId(workflow_id),
      module: ModuleId(2),
      compo: Compo::Active,
      formal: false,
      title: format!("workflow {}", workflow_id),
      initial_status: initial,
      active: true,
    }
  }

  fn status(status_id: i64, workflow_id: i64) -> Status {
    Status {
      status_id: StatusId(status_id),
      workflow_id: WorkflowId(workflow_id),
      description: format!("status {}", status_id),
      labels: Default::default(),
      sort_order: 0,
      is_board: false,
      is_holding: false,
      is_consult: false,
      owner_group: None,
    }
  }

  #[tokio::test]
  async fn test_option_owner_is_resolved_after_waiting_for_other_edits() {
    let store = Arc::new(MemoryStore::new());
    let mut first = WorkflowDefinition::empty(workflow(1, Some(StatusId(10))));
    first.statuses = vec![status(10, 1), status(11, 1)];
    store.save_definition(&first).await.unwrap();
    let engine = Engine::new(store.clone(), &EngineConfig::default());
    let cancel = CancellationToken::new();

    let guard = engine.definition_guard().await;
    let insert = engine.insert_option(
      NewOption {
        status_id: StatusId(11),
        target: None,
        text: "Close".to_string(),
        active: true,
        sort_order: 0,
        template_id: None,
        check_all: false,
        cross_workflow: false,
        compos: Vec::new(),
      },
      &cancel,
    );
    tokio::pin!(insert);
    assert!(
      tokio::time::timeout(Duration::from_millis(50), &mut insert)
        .await
        .is_err()
    );

    // Status 11 moves to workflow 2 while the insert waits
    first.statuses.truncate(1);
    store.save_definition(&first).await.unwrap();
    let mut second = WorkflowDefinition::empty(workflow(2, Some(StatusId(11))));
    second.statuses = vec![status(11, 2)];
    store.save_definition(&second).await.unwrap();
    drop(guard);

    let option = insert.await.unwrap();
    assert_eq!(option.status_id, StatusId(11));
    let second = store.load_definition(WorkflowId(2)).await.unwrap();
    assert_eq!(second.options, vec![option]);
    assert!(
      store
        .load_definition(WorkflowId(1))
        .await
        .unwrap()
        .options
        .is_empty()
    );
  }
}
