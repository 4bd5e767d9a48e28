//! The data rules, validations and actions are evaluated against.

use std::collections::BTreeSet;

use ect_config::{StatusId, UserId};
use ect_store::{CaseRecord, Signature};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The user performing an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
  pub user_id: UserId,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub rank: Option<String>,
  /// Groups the user belongs to, e.g. `wing_ja` or `board_medical`.
  #[serde(default)]
  pub groups: BTreeSet<String>,
}

impl Actor {
  pub fn new(user_id: UserId, name: impl Into<String>) -> Self {
    Self {
      user_id,
      name: name.into(),
      rank: None,
      groups: BTreeSet::new(),
    }
  }

  pub fn with_rank(mut self, rank: impl Into<String>) -> Self {
    self.rank = Some(rank.into());
    self
  }

  pub fn with_group(mut self, group: impl Into<String>) -> Self {
    self.groups.insert(group.into());
    self
  }

  /// Rank and name as recorded on audit rows and signatures.
  pub fn name_rank(&self) -> String {
    match &self.rank {
      Some(rank) => format!("{} {}", rank, self.name),
      None => self.name.clone(),
    }
  }

  pub fn in_group(&self, group: &str) -> bool {
    self.groups.contains(group)
  }
}

/// A case as seen by the evaluator at one point in time.
#[derive(Debug, Clone)]
pub struct CaseContext {
  pub case: CaseRecord,
  pub actor: Actor,
  pub signatures: Vec<Signature>,
}

impl CaseContext {
  pub fn new(case: CaseRecord, actor: Actor, signatures: Vec<Signature>) -> Self {
    Self {
      case,
      actor,
      signatures,
    }
  }

  /// A case field, treating JSON `null` as absent.
  pub fn field(&self, name: &str) -> Option<&Value> {
    self.case.fields.get(name).filter(|v| !v.is_null())
  }

  /// A field is set when present, not null and not an empty string.
  pub fn is_field_set(&self, name: &str) -> bool {
    match self.field(name) {
      None => false,
      Some(Value::String(s)) => !s.trim().is_empty(),
      Some(_) => true,
    }
  }

  pub fn has_signature_at(&self, status_id: StatusId) -> bool {
    self.signatures.iter().any(|s| s.status_id == status_id)
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;
  use ect_config::{ModuleId, RefId, WorkflowId};
  use ect_store::CaseFields;
  use serde_json::json;

  use super::*;

  fn context(fields: Value) -> CaseContext {
    let fields: CaseFields = serde_json::from_value(fields).unwrap();
    CaseContext::new(
      CaseRecord {
        ref_id: RefId(1),
        module: ModuleId(2),
        workflow_id: WorkflowId(3),
        status_id: Some(StatusId(10)),
        fields,
        created_at: Utc::now(),
        completed_at: None,
      },
      Actor::new(UserId(1), "Smith").with_rank("Capt"),
      Vec::new(),
    )
  }

  #[test]
  fn test_field_set_semantics() {
    let ctx = context(json!({ "a": "x", "b": "  ", "c": null, "d": 0, "e": false }));
    assert!(ctx.is_field_set("a"));
    assert!(!ctx.is_field_set("b"));
    assert!(!ctx.is_field_set("c"));
    assert!(ctx.is_field_set("d"));
    assert!(ctx.is_field_set("e"));
    assert!(!ctx.is_field_set("missing"));
  }

  #[test]
  fn test_name_rank() {
    let actor = Actor::new(UserId(1), "Smith").with_rank("Capt");
    assert_eq!(actor.name_rank(), "Capt Smith");
    assert_eq!(Actor::new(UserId(2), "Jones").name_rank(), "Jones");
  }
}
