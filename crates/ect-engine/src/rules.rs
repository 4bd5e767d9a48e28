//! Rule and validation evaluation.
//!
//! Rules gate an option, validations gate leaving a status. Both are rows with
//! a type tag and a JSON payload; the tag selects a [`Predicate`] from an
//! explicit [`PredicateRegistry`]. Tags that are not registered, and payloads
//! a predicate cannot read, fail the check.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ect_config::{OptionId, StatusId};
use ect_workflow::StatusGraph;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::CaseContext;
use crate::error::{EngineError, FailedCheck};

/// Outcome of a single predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
  Pass,
  Fail(String),
}

/// A predicate could not interpret its payload.
#[derive(Debug, Error)]
#[error("malformed payload: {0}")]
pub struct PredicateError(#[from] serde_json::Error);

/// A check selected by a rule or validation type tag.
pub trait Predicate: Send + Sync {
  fn check(&self, data: &Value, ctx: &CaseContext) -> Result<Verdict, PredicateError>;
}

#[derive(Deserialize)]
struct FieldArg {
  field: String,
}

#[derive(Deserialize)]
struct FieldValueArg {
  field: String,
  value: Value,
}

#[derive(Deserialize)]
struct GroupArg {
  group: String,
}

/// `{field}`: the case field is present, non-null and non-blank.
pub struct RequireField;

impl Predicate for RequireField {
  fn check(&self, data: &Value, ctx: &CaseContext) -> Result<Verdict, PredicateError> {
    let arg = FieldArg::deserialize(data)?;
    if ctx.is_field_set(&arg.field) {
      Ok(Verdict::Pass)
    } else {
      Ok(Verdict::Fail(format!("field '{}' is not set", arg.field)))
    }
  }
}

/// `{field, value}`: the case field equals the given JSON value.
pub struct FieldEquals;

impl Predicate for FieldEquals {
  fn check(&self, data: &Value, ctx: &CaseContext) -> Result<Verdict, PredicateError> {
    let arg = FieldValueArg::deserialize(data)?;
    if ctx.field(&arg.field) == Some(&arg.value) {
      Ok(Verdict::Pass)
    } else {
      Ok(Verdict::Fail(format!(
        "field '{}' is not {}",
        arg.field, arg.value
      )))
    }
  }
}

/// `{field}`: the case field is not set.
pub struct FieldAbsent;

impl Predicate for FieldAbsent {
  fn check(&self, data: &Value, ctx: &CaseContext) -> Result<Verdict, PredicateError> {
    let arg = FieldArg::deserialize(data)?;
    if ctx.is_field_set(&arg.field) {
      Ok(Verdict::Fail(format!("field '{}' is set", arg.field)))
    } else {
      Ok(Verdict::Pass)
    }
  }
}

/// `{group}`: the acting user belongs to the group.
pub struct MemberOfGroup;

impl Predicate for MemberOfGroup {
  fn check(&self, data: &Value, ctx: &CaseContext) -> Result<Verdict, PredicateError> {
    let arg = GroupArg::deserialize(data)?;
    if ctx.actor.in_group(&arg.group) {
      Ok(Verdict::Pass)
    } else {
      Ok(Verdict::Fail(format!(
        "{} is not a member of '{}'",
        ctx.actor.name_rank(),
        arg.group
      )))
    }
  }
}

/// `{}`: a signature was recorded for the case at its current status.
pub struct RequireSignature;

impl Predicate for RequireSignature {
  fn check(&self, _data: &Value, ctx: &CaseContext) -> Result<Verdict, PredicateError> {
    match ctx.case.status_id {
      Some(status_id) if ctx.has_signature_at(status_id) => Ok(Verdict::Pass),
      Some(status_id) => Ok(Verdict::Fail(format!(
        "no signature recorded at status {}",
        status_id
      ))),
      None => Ok(Verdict::Fail("case is complete".to_string())),
    }
  }
}

/// Maps type tags to predicates.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
  predicates: HashMap<String, Arc<dyn Predicate>>,
}

impl PredicateRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Built-in option rule types.
  pub fn standard_rules() -> Self {
    let mut registry = Self::new();
    registry
      .register("require_field", RequireField)
      .register("field_equals", FieldEquals)
      .register("field_absent", FieldAbsent)
      .register("member_of_group", MemberOfGroup);
    registry
  }

  /// Built-in status validation types.
  pub fn standard_validations() -> Self {
    let mut registry = Self::new();
    registry
      .register("require_field", RequireField)
      .register("require_signature", RequireSignature)
      .register("member_of_group", MemberOfGroup);
    registry
  }

  /// Register a predicate, replacing any previous one with the same tag.
  pub fn register(
    &mut self,
    tag: impl Into<String>,
    predicate: impl Predicate + 'static,
  ) -> &mut Self {
    self.predicates.insert(tag.into(), Arc::new(predicate));
    self
  }

  pub fn contains(&self, tag: &str) -> bool {
    self.predicates.contains_key(tag)
  }

  fn run(&self, kind: &str, id: i64, tag: &str, data: &Value, ctx: &CaseContext) -> Option<Failure> {
    let failed = |message: String, broken: bool| Failure {
      check: FailedCheck {
        id,
        check_type: tag.to_string(),
        message,
      },
      broken,
    };

    let Some(predicate) = self.predicates.get(tag) else {
      warn!(kind, id, tag, "unknown check type, failing closed");
      return Some(failed(format!("unknown {} type '{}'", kind, tag), true));
    };

    match predicate.check(data, ctx) {
      Ok(Verdict::Pass) => None,
      Ok(Verdict::Fail(message)) => Some(failed(message, false)),
      Err(e) => {
        warn!(kind, id, tag, error = %e, "check payload unreadable, failing closed");
        Some(failed(e.to_string(), true))
      }
    }
  }
}

impl fmt::Debug for PredicateRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut tags: Vec<&String> = self.predicates.keys().collect();
    tags.sort();
    f.debug_struct("PredicateRegistry").field("tags", &tags).finish()
  }
}

/// A check that did not pass. `broken` marks a check that could not be run
/// at all: an unknown tag or an unreadable payload.
struct Failure {
  check: FailedCheck,
  broken: bool,
}

/// Result of evaluating an option's rules or a status's validations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationResult {
  pub passed: bool,
  pub failed: Vec<FailedCheck>,
}

/// Evaluates option rules and status validations against a case.
#[derive(Debug, Clone)]
pub struct Evaluator {
  rules: PredicateRegistry,
  validations: PredicateRegistry,
}

impl Default for Evaluator {
  fn default() -> Self {
    Self::new(
      PredicateRegistry::standard_rules(),
      PredicateRegistry::standard_validations(),
    )
  }
}

impl Evaluator {
  pub fn new(rules: PredicateRegistry, validations: PredicateRegistry) -> Self {
    Self { rules, validations }
  }

  pub fn rules(&self) -> &PredicateRegistry {
    &self.rules
  }

  pub fn validations(&self) -> &PredicateRegistry {
    &self.validations
  }

  /// Evaluate an option's rules.
  ///
  /// `check_all` on the option selects AND, otherwise any passing rule is
  /// enough. A rule that cannot be run rejects the option either way. An
  /// option without rules passes. Every rule is run so the result lists all
  /// failures.
  pub fn evaluate(
    &self,
    graph: &StatusGraph,
    option_id: OptionId,
    ctx: &CaseContext,
  ) -> Result<EvaluationResult, EngineError> {
    let option = graph
      .option(option_id)
      .ok_or_else(|| EngineError::not_found(format!("option {}", option_id)))?;
    let rules = graph.rules_for(option_id)?;
    if rules.is_empty() {
      return Ok(EvaluationResult {
        passed: true,
        failed: Vec::new(),
      });
    }

    let failures: Vec<Failure> = rules
      .iter()
      .filter_map(|r| self.rules.run("rule", r.rule_id.0, &r.rule_type, &r.data, ctx))
      .collect();
    let broken = failures.iter().any(|f| f.broken);
    let failed: Vec<FailedCheck> = failures.into_iter().map(|f| f.check).collect();

    let passed = if broken {
      false
    } else if option.check_all {
      failed.is_empty()
    } else {
      failed.len() < rules.len()
    };

    debug!(
      option_id = %option_id,
      check_all = option.check_all,
      rules = rules.len(),
      failed = failed.len(),
      passed,
      "rules evaluated"
    );

    Ok(EvaluationResult { passed, failed })
  }

  /// Evaluate a status's active validations. All must pass.
  pub fn evaluate_status_validations(
    &self,
    graph: &StatusGraph,
    status_id: StatusId,
    ctx: &CaseContext,
  ) -> Result<EvaluationResult, EngineError> {
    let failed: Vec<FailedCheck> = graph
      .validations_for(status_id)?
      .iter()
      .filter_map(|v| {
        self.validations.run(
          "validation",
          v.validation_id.0,
          &v.validation_type,
          &v.data,
          ctx,
        )
      })
      .map(|f| f.check)
      .collect();

    Ok(EvaluationResult {
      passed: failed.is_empty(),
      failed,
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;
  use ect_config::{
    Compo, ModuleId, RefId, RuleId, SignatureId, Status, StatusOption, StatusRule,
    StatusValidation, UserId, ValidationId, Workflow, WorkflowDefinition, WorkflowId,
  };
  use ect_store::{CaseFields, CaseRecord, Signature};
  use serde_json::json;

  use super::*;
  use crate::context::Actor;

  fn graph(check_all: bool, rules: Vec<(&str, Value)>) -> StatusGraph {
    let workflow = Workflow {
      workflow_id: WorkflowId(1),
      module: ModuleId(2),
      compo: Compo::Active,
      formal: false,
      title: "Informal LOD".to_string(),
      initial_status: Some(StatusId(10)),
      active: true,
    };
    let status = |id: i64| Status {
      status_id: StatusId(id),
      workflow_id: WorkflowId(1),
      description: format!("status {}", id),
      labels: Default::default(),
      sort_order: 0,
      is_board: false,
      is_holding: false,
      is_consult: false,
      owner_group: None,
    };
    let mut def = WorkflowDefinition::empty(workflow);
    def.statuses = vec![status(10), status(11)];
    def.options.push(StatusOption {
      option_id: OptionId(100),
      status_id: StatusId(10),
      target: Some(StatusId(11)),
      text: "Forward".to_string(),
      active: true,
      sort_order: 0,
      template_id: None,
      check_all,
      cross_workflow: false,
      compos: Vec::new(),
    });
    def.rules = rules
      .into_iter()
      .enumerate()
      .map(|(i, (tag, data))| StatusRule {
        rule_id: RuleId(i as i64 + 1),
        option_id: OptionId(100),
        rule_type: tag.to_string(),
        data,
      })
      .collect();
    def.validations = vec![
      StatusValidation {
        validation_id: ValidationId(1),
        status_id: StatusId(10),
        validation_type: "require_signature".to_string(),
        data: json!({}),
        active: true,
      },
      StatusValidation {
        validation_id: ValidationId(2),
        status_id: StatusId(10),
        validation_type: "require_field".to_string(),
        data: json!({ "field": "never_checked" }),
        active: false,
      },
    ];
    StatusGraph::build(def).unwrap()
  }

  fn context(fields: Value, signed: bool) -> CaseContext {
    let fields: CaseFields = serde_json::from_value(fields).unwrap();
    let signatures = if signed {
      vec![Signature {
        signature_id: SignatureId(1),
        ref_id: RefId(7),
        module: ModuleId(2),
        status_id: StatusId(10),
        user_id: UserId(1),
        name_rank: "Capt Smith".to_string(),
        signed_at: Utc::now(),
      }]
    } else {
      Vec::new()
    };
    CaseContext::new(
      CaseRecord {
        ref_id: RefId(7),
        module: ModuleId(2),
        workflow_id: WorkflowId(1),
        status_id: Some(StatusId(10)),
        fields,
        created_at: Utc::now(),
        completed_at: None,
      },
      Actor::new(UserId(1), "Smith")
        .with_rank("Capt")
        .with_group("unit_cc"),
      signatures,
    )
  }

  fn failing_and_passing() -> Vec<(&'static str, Value)> {
    vec![
      ("require_field", json!({ "field": "x" })),
      ("member_of_group", json!({ "group": "unit_cc" })),
    ]
  }

  #[test]
  fn test_check_all_rejects_when_any_rule_fails() {
    let graph = graph(true, failing_and_passing());
    let result = Evaluator::default()
      .evaluate(&graph, OptionId(100), &context(json!({}), false))
      .unwrap();
    assert!(!result.passed);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].check_type, "require_field");
  }

  #[test]
  fn test_any_accepts_when_one_rule_passes() {
    let graph = graph(false, failing_and_passing());
    let result = Evaluator::default()
      .evaluate(&graph, OptionId(100), &context(json!({}), false))
      .unwrap();
    assert!(result.passed);
  }

  #[test]
  fn test_any_rejects_when_every_rule_fails() {
    let graph = graph(
      false,
      vec![
        ("require_field", json!({ "field": "x" })),
        ("field_equals", json!({ "field": "finding", "value": "in_lod" })),
      ],
    );
    let result = Evaluator::default()
      .evaluate(&graph, OptionId(100), &context(json!({ "finding": "epts" }), false))
      .unwrap();
    assert!(!result.passed);
    assert_eq!(result.failed.len(), 2);
  }

  #[test]
  fn test_no_rules_passes() {
    let graph = graph(true, Vec::new());
    let result = Evaluator::default()
      .evaluate(&graph, OptionId(100), &context(json!({}), false))
      .unwrap();
    assert!(result.passed);
    assert!(result.failed.is_empty());
  }

  #[test]
  fn test_unknown_tag_fails_closed() {
    let graph = graph(false, vec![("consult_oracle", json!({}))]);
    let result = Evaluator::default()
      .evaluate(&graph, OptionId(100), &context(json!({}), false))
      .unwrap();
    assert!(!result.passed);
    assert!(result.failed[0].message.contains("unknown rule type"));
  }

  #[test]
  fn test_unknown_tag_rejects_any_option_despite_passing_rule() {
    let graph = graph(
      false,
      vec![
        ("consult_oracle", json!({})),
        ("require_field", json!({ "field": "member_name" })),
      ],
    );
    let result = Evaluator::default()
      .evaluate(
        &graph,
        OptionId(100),
        &context(json!({ "member_name": "Doe" }), false),
      )
      .unwrap();
    assert!(!result.passed);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].check_type, "consult_oracle");
  }

  #[test]
  fn test_malformed_payload_rejects_any_option() {
    let graph = graph(
      false,
      vec![
        ("require_field", json!({ "name": "x" })),
        ("require_field", json!({ "field": "x" })),
      ],
    );
    let result = Evaluator::default()
      .evaluate(&graph, OptionId(100), &context(json!({ "x": 1 }), false))
      .unwrap();
    assert!(!result.passed);
  }

  #[test]
  fn test_malformed_payload_fails_closed() {
    let graph = graph(true, vec![("require_field", json!({ "name": "x" }))]);
    let result = Evaluator::default()
      .evaluate(&graph, OptionId(100), &context(json!({ "x": 1 }), false))
      .unwrap();
    assert!(!result.passed);
  }

  #[test]
  fn test_field_predicates() {
    let graph = graph(
      true,
      vec![
        ("field_equals", json!({ "field": "finding", "value": "in_lod" })),
        ("field_absent", json!({ "field": "appeal" })),
      ],
    );
    let ctx = context(json!({ "finding": "in_lod", "appeal": null }), false);
    assert!(
      Evaluator::default()
        .evaluate(&graph, OptionId(100), &ctx)
        .unwrap()
        .passed
    );
  }

  #[test]
  fn test_unknown_option_is_not_found() {
    let graph = graph(true, Vec::new());
    let err = Evaluator::default()
      .evaluate(&graph, OptionId(999), &context(json!({}), false))
      .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
  }

  #[test]
  fn test_validations_require_signature_and_skip_inactive() {
    let graph = graph(true, Vec::new());
    let evaluator = Evaluator::default();

    let unsigned = evaluator
      .evaluate_status_validations(&graph, StatusId(10), &context(json!({}), false))
      .unwrap();
    assert!(!unsigned.passed);
    assert_eq!(unsigned.failed.len(), 1);
    assert_eq!(unsigned.failed[0].check_type, "require_signature");

    let signed = evaluator
      .evaluate_status_validations(&graph, StatusId(10), &context(json!({}), true))
      .unwrap();
    assert!(signed.passed);
  }

  #[test]
  fn test_custom_predicate_registration() {
    struct AlwaysFails;
    impl Predicate for AlwaysFails {
      fn check(&self, _data: &Value, _ctx: &CaseContext) -> Result<Verdict, PredicateError> {
        Ok(Verdict::Fail("nope".to_string()))
      }
    }

    let mut rules = PredicateRegistry::standard_rules();
    rules.register("always_fails", AlwaysFails);
    assert!(rules.contains("always_fails"));

    let evaluator = Evaluator::new(rules, PredicateRegistry::standard_validations());
    let graph = graph(true, vec![("always_fails", json!(null))]);
    let result = evaluator
      .evaluate(&graph, OptionId(100), &context(json!({}), true))
      .unwrap();
    assert!(!result.passed);
    assert_eq!(result.failed[0].message, "nope");
  }
}
