//! Option actions.
//!
//! Actions never touch the store directly. Each executor turns its payload
//! into [`Effect`]s which are folded into [`StagedEffects`] and committed in
//! the same store transaction as the tracking rows.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ect_config::{StatusAction, StatusId};
use ect_store::{CaseFields, NewSignature};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::context::CaseContext;
use crate::error::EngineError;

/// A single staged change produced by an action.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
  SetField { field: String, value: Value },
  ClearField { field: String },
  /// Record the actor's signature at the status being left.
  Sign,
  /// Notify a group once the transition commits.
  Notify { group: String },
}

/// Turns an action payload into effects.
pub trait ActionExecutor: Send + Sync {
  fn execute(&self, data: &Value, ctx: &CaseContext) -> Result<Vec<Effect>, String>;
}

#[derive(Deserialize)]
struct SetFieldArg {
  field: String,
  value: Value,
}

#[derive(Deserialize)]
struct FieldArg {
  field: String,
}

#[derive(Deserialize)]
struct GroupArg {
  group: String,
}

/// `{field, value}`
pub struct SetField;

impl ActionExecutor for SetField {
  fn execute(&self, data: &Value, _ctx: &CaseContext) -> Result<Vec<Effect>, String> {
    let arg = SetFieldArg::deserialize(data).map_err(|e| e.to_string())?;
    Ok(vec![Effect::SetField {
      field: arg.field,
      value: arg.value,
    }])
  }
}

/// `{field}`
pub struct ClearField;

impl ActionExecutor for ClearField {
  fn execute(&self, data: &Value, _ctx: &CaseContext) -> Result<Vec<Effect>, String> {
    let arg = FieldArg::deserialize(data).map_err(|e| e.to_string())?;
    Ok(vec![Effect::ClearField { field: arg.field }])
  }
}

/// `{}`
pub struct AddSignature;

impl ActionExecutor for AddSignature {
  fn execute(&self, _data: &Value, ctx: &CaseContext) -> Result<Vec<Effect>, String> {
    if ctx.case.is_complete() {
      return Err("cannot sign a completed case".to_string());
    }
    Ok(vec![Effect::Sign])
  }
}

/// `{group}`
pub struct NotifyGroup;

impl ActionExecutor for NotifyGroup {
  fn execute(&self, data: &Value, _ctx: &CaseContext) -> Result<Vec<Effect>, String> {
    let arg = GroupArg::deserialize(data).map_err(|e| e.to_string())?;
    if arg.group.trim().is_empty() {
      return Err("group must not be blank".to_string());
    }
    Ok(vec![Effect::Notify { group: arg.group }])
  }
}

/// Everything a transition's actions want to change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedEffects {
  /// Case fields after the actions ran. `None` when no action touched them.
  pub fields: Option<CaseFields>,
  pub signatures: Vec<NewSignature>,
  pub notifications: Vec<String>,
}

/// Maps action type tags to executors.
#[derive(Clone, Default)]
pub struct ActionRegistry {
  executors: HashMap<String, Arc<dyn ActionExecutor>>,
}

impl ActionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Built-in action types.
  pub fn standard() -> Self {
    let mut registry = Self::new();
    registry
      .register("set_field", SetField)
      .register("clear_field", ClearField)
      .register("add_signature", AddSignature)
      .register("require_signature", AddSignature)
      .register("notify_group", NotifyGroup);
    registry
  }

  pub fn register(
    &mut self,
    tag: impl Into<String>,
    executor: impl ActionExecutor + 'static,
  ) -> &mut Self {
    self.executors.insert(tag.into(), Arc::new(executor));
    self
  }

  pub fn contains(&self, tag: &str) -> bool {
    self.executors.contains_key(tag)
  }

  /// Run actions in the given order and stage their effects.
  ///
  /// The first failing action aborts the run; nothing staged so far escapes.
  pub fn run(
    &self,
    actions: &[&StatusAction],
    ctx: &CaseContext,
    leaving: StatusId,
    now: DateTime<Utc>,
  ) -> Result<StagedEffects, EngineError> {
    let mut staged = StagedEffects::default();

    for action in actions {
      let failed = |message: String| EngineError::ActionFailed {
        action_id: action.action_id,
        action_type: action.action_type.clone(),
        message,
      };

      let executor = self
        .executors
        .get(&action.action_type)
        .ok_or_else(|| failed(format!("unknown action type '{}'", action.action_type)))?;
      let effects = executor.execute(&action.data, ctx).map_err(failed)?;

      debug!(
        action_id = %action.action_id,
        action_type = %action.action_type,
        effects = effects.len(),
        "action staged"
      );

      for effect in effects {
        match effect {
          Effect::SetField { field, value } => {
            staged
              .fields
              .get_or_insert_with(|| ctx.case.fields.clone())
              .insert(field, value);
          }
          Effect::ClearField { field } => {
            staged
              .fields
              .get_or_insert_with(|| ctx.case.fields.clone())
              .remove(&field);
          }
          Effect::Sign => {
            let already = staged.signatures.iter().any(|s| s.status_id == leaving);
            if !already {
              staged.signatures.push(NewSignature {
                ref_id: ctx.case.ref_id,
                module: ctx.case.module,
                status_id: leaving,
                user_id: ctx.actor.user_id,
                name_rank: ctx.actor.name_rank(),
                signed_at: now,
              });
            }
          }
          Effect::Notify { group } => {
            if !staged.notifications.contains(&group) {
              staged.notifications.push(group);
            }
          }
        }
      }
    }

    Ok(staged)
  }
}

impl fmt::Debug for ActionRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut tags: Vec<&String> = self.executors.keys().collect();
    tags.sort();
    f.debug_struct("ActionRegistry").field("tags", &tags).finish()
  }
}
