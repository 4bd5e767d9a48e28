//! Integration tests for workflow administration.

use std::sync::Arc;

use ect_config::{
  Compo, EngineConfig, ModuleId, OptionId, RefId, StatusId, UserId, Workflow, WorkflowDefinition,
  WorkflowId,
};
use ect_engine::{
  Actor, Engine, ErrorKind, NewAction, NewOption, NewRule, NewStatus, NewValidation,
  StartCaseRequest,
};
use ect_store::{MemoryStore, Store};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn header(workflow_id: i64, title: &str) -> Workflow {
  Workflow {
    workflow_id: WorkflowId(workflow_id),
    module: ModuleId(2),
    compo: Compo::Active,
    formal: false,
    title: title.to_string(),
    initial_status: None,
    active: true,
  }
}

fn new_status(workflow_id: i64, description: &str, initial: bool) -> NewStatus {
  NewStatus {
    workflow_id: WorkflowId(workflow_id),
    description: description.to_string(),
    labels: Default::default(),
    sort_order: 0,
    is_board: false,
    is_holding: false,
    is_consult: false,
    owner_group: None,
    initial,
  }
}

fn new_option(status_id: StatusId, target: Option<StatusId>, text: &str) -> NewOption {
  NewOption {
    status_id,
    target,
    text: text.to_string(),
    active: true,
    sort_order: 0,
    template_id: None,
    check_all: false,
    cross_workflow: false,
    compos: Vec::new(),
  }
}

fn engine() -> Engine {
  Engine::new(Arc::new(MemoryStore::new()), &EngineConfig::default())
}

/// Builds `Intake --Forward--> Review --Close--> done` in workflow 1.
async fn build_informal(engine: &Engine) -> (StatusId, StatusId, OptionId, OptionId) {
  let cancel = CancellationToken::new();
  engine
    .create_workflow(header(1, "Informal LOD"), &cancel)
    .await
    .unwrap();
  let intake = engine
    .insert_workstatus(new_status(1, "Unit Intake", true), &cancel)
    .await
    .unwrap()
    .status_id;
  let review = engine
    .insert_workstatus(new_status(1, "Wing Review", false), &cancel)
    .await
    .unwrap()
    .status_id;
  let forward = engine
    .insert_option(new_option(intake, Some(review), "Forward"), &cancel)
    .await
    .unwrap()
    .option_id;
  let close = engine
    .insert_option(new_option(review, None, "Close"), &cancel)
    .await
    .unwrap()
    .option_id;
  engine
    .insert_action(
      NewAction {
        option_id: forward,
        action_type: "notify_group".to_string(),
        sort_order: 0,
        data: json!({ "group": "wing_ja" }),
      },
      &cancel,
    )
    .await
    .unwrap();
  engine
    .insert_rule(
      NewRule {
        option_id: forward,
        rule_type: "require_field".to_string(),
        data: json!({ "field": "member_name" }),
      },
      &cancel,
    )
    .await
    .unwrap();
  engine
    .insert_validation(
      NewValidation {
        status_id: review,
        validation_type: "require_signature".to_string(),
        data: json!({}),
        active: true,
      },
      &cancel,
    )
    .await
    .unwrap();
  (intake, review, forward, close)
}

#[tokio::test]
async fn test_inserts_build_a_runnable_workflow() {
  let engine = engine();
  let (intake, review, forward, close) = build_informal(&engine).await;

  assert_eq!(engine.initial_status(WorkflowId(1)).await.unwrap().status_id, intake);
  let statuses = engine.statuses(WorkflowId(1)).await.unwrap();
  assert_eq!(statuses.len(), 2);

  let options = engine
    .options_for_status(WorkflowId(1), intake, None)
    .await
    .unwrap();
  assert_eq!(options.len(), 1);
  assert_eq!(options[0].target, Some(review));

  let actions = engine.actions_for_option(forward).await.unwrap();
  assert_eq!(actions.len(), 1);
  assert_eq!(actions[0].action_type, "notify_group");

  let graph = engine.graph(WorkflowId(1)).await.unwrap();
  assert_eq!(graph.rules_for(forward).unwrap().len(), 1);
  assert_eq!(graph.validations_for(review).unwrap().len(), 1);
  assert!(graph.option(close).unwrap().is_terminal());
}

#[tokio::test]
async fn test_edits_invalidate_cached_graph() {
  let engine = engine();
  let (intake, review, _, _) = build_informal(&engine).await;
  let cancel = CancellationToken::new();

  // Warm the cache, then edit
  assert_eq!(
    engine
      .options_for_status(WorkflowId(1), intake, None)
      .await
      .unwrap()
      .len(),
    1
  );
  engine
    .insert_option(new_option(intake, Some(review), "Forward (expedited)"), &cancel)
    .await
    .unwrap();

  let options = engine
    .options_for_status(WorkflowId(1), intake, None)
    .await
    .unwrap();
  assert_eq!(options.len(), 2);
}

#[tokio::test]
async fn test_unknown_tags_are_rejected() {
  let engine = engine();
  let (_, _, forward, _) = build_informal(&engine).await;
  let cancel = CancellationToken::new();

  let err = engine
    .insert_action(
      NewAction {
        option_id: forward,
        action_type: "send_fax".to_string(),
        sort_order: 0,
        data: json!({}),
      },
      &cancel,
    )
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidDefinition);

  let err = engine
    .insert_rule(
      NewRule {
        option_id: forward,
        rule_type: "moon_phase".to_string(),
        data: json!({}),
      },
      &cancel,
    )
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidDefinition);

  // Nothing was saved
  assert_eq!(engine.actions_for_option(forward).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_option_to_foreign_status_needs_cross_workflow_flag() {
  let engine = engine();
  let (intake, _, _, _) = build_informal(&engine).await;
  let cancel = CancellationToken::new();
  engine
    .create_workflow(header(2, "Appeal"), &cancel)
    .await
    .unwrap();
  let appeal = engine
    .insert_workstatus(new_status(2, "Appeal Intake", true), &cancel)
    .await
    .unwrap()
    .status_id;

  let err = engine
    .insert_option(new_option(intake, Some(appeal), "Promote"), &cancel)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidDefinition);

  let mut promote = new_option(intake, Some(appeal), "Promote");
  promote.cross_workflow = true;
  engine.insert_option(promote, &cancel).await.unwrap();

  let mut dangling = new_option(intake, Some(StatusId(999)), "Nowhere");
  dangling.cross_workflow = true;
  let err = engine.insert_option(dangling, &cancel).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidDefinition);
}

#[tokio::test]
async fn test_update_workstatus() {
  let engine = engine();
  let (_, review, _, _) = build_informal(&engine).await;
  let cancel = CancellationToken::new();

  let mut status = engine.store().find_status(review).await.unwrap();
  status.description = "Wing JA Review".to_string();
  status.owner_group = Some("wing_ja".to_string());
  engine.update_workstatus(status.clone(), &cancel).await.unwrap();

  let graph = engine.graph(WorkflowId(1)).await.unwrap();
  assert_eq!(graph.status(review).unwrap().description, "Wing JA Review");

  status.workflow_id = WorkflowId(9);
  let err = engine.update_workstatus(status, &cancel).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn test_copy_workflow_remaps_ids() {
  let engine = engine();
  let (intake, review, forward, _) = build_informal(&engine).await;
  let cancel = CancellationToken::new();
  engine
    .create_workflow(header(3, "Informal LOD (Guard)"), &cancel)
    .await
    .unwrap();

  let copy = engine
    .copy_workflow(WorkflowId(1), WorkflowId(3), &cancel)
    .await
    .unwrap();
  assert_eq!(copy.workflow.title, "Informal LOD (Guard)");
  assert_eq!(copy.statuses.len(), 2);
  assert_eq!(copy.options.len(), 2);
  assert_eq!(copy.actions.len(), 1);
  assert_eq!(copy.rules.len(), 1);
  assert_eq!(copy.validations.len(), 1);

  let copied_ids: Vec<StatusId> = copy.statuses.iter().map(|s| s.status_id).collect();
  assert!(!copied_ids.contains(&intake));
  assert!(!copied_ids.contains(&review));
  assert!(copy.statuses.iter().all(|s| s.workflow_id == WorkflowId(3)));

  let initial = copy.workflow.initial_status.unwrap();
  assert!(copied_ids.contains(&initial));
  let copied_forward = copy
    .options
    .iter()
    .find(|o| o.status_id == initial)
    .unwrap();
  assert_ne!(copied_forward.option_id, forward);
  assert!(copied_ids.contains(&copied_forward.target.unwrap()));
  assert_eq!(copy.actions[0].option_id, copied_forward.option_id);

  // The source is unchanged
  let source = engine.store().load_definition(WorkflowId(1)).await.unwrap();
  assert_eq!(source.workflow.initial_status, Some(intake));
  assert_eq!(source.statuses.len(), 2);
}

#[tokio::test]
async fn test_copy_workflow_requires_empty_target() {
  let engine = engine();
  build_informal(&engine).await;
  let cancel = CancellationToken::new();

  let err = engine
    .copy_workflow(WorkflowId(1), WorkflowId(1), &cancel)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidRequest);

  engine
    .create_workflow(header(3, "Copy"), &cancel)
    .await
    .unwrap();
  engine
    .copy_workflow(WorkflowId(1), WorkflowId(3), &cancel)
    .await
    .unwrap();
  let err = engine
    .copy_workflow(WorkflowId(1), WorkflowId(3), &cancel)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidDefinition);

  let err = engine
    .copy_workflow(WorkflowId(1), WorkflowId(42), &cancel)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_copy_actions_and_rules_between_options() {
  let engine = engine();
  let (intake, review, forward, _) = build_informal(&engine).await;
  let cancel = CancellationToken::new();
  let expedited = engine
    .insert_option(new_option(intake, Some(review), "Forward (expedited)"), &cancel)
    .await
    .unwrap()
    .option_id;

  let actions = engine
    .copy_actions(forward, expedited, &cancel)
    .await
    .unwrap();
  assert_eq!(actions.len(), 1);
  assert_eq!(actions[0].option_id, expedited);

  let rules = engine.copy_rules(forward, expedited, &cancel).await.unwrap();
  assert_eq!(rules.len(), 1);
  assert_eq!(rules[0].rule_type, "require_field");

  let graph = engine.graph(WorkflowId(1)).await.unwrap();
  assert_eq!(graph.actions_for(expedited).unwrap().len(), 1);
  assert_eq!(graph.rules_for(expedited).unwrap().len(), 1);
  assert_eq!(graph.actions_for(forward).unwrap().len(), 1);

  let err = engine
    .copy_rules(forward, forward, &cancel)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn test_import_definition_validates_graph() {
  let engine = engine();
  let cancel = CancellationToken::new();

  let mut definition: WorkflowDefinition = serde_json::from_value(json!({
    "workflow": { "workflow_id": 5, "module": 2, "compo": "reserve", "title": "Reserve LOD", "initial_status": 50 },
    "statuses": [
      { "status_id": 50, "workflow_id": 5, "description": "Intake" },
      { "status_id": 51, "workflow_id": 5, "description": "Review" }
    ],
    "options": [
      { "option_id": 500, "status_id": 50, "target": 51, "text": "Forward" }
    ]
  }))
  .unwrap();

  let graph = engine
    .import_definition(definition.clone(), &cancel)
    .await
    .unwrap();
  assert_eq!(graph.statuses().len(), 2);

  definition.options[0].target = Some(StatusId(77));
  let err = engine
    .import_definition(definition, &cancel)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidDefinition);

  // The first import is still in place
  let options = engine
    .options_for_status(WorkflowId(5), StatusId(50), Some(Compo::Reserve))
    .await
    .unwrap();
  assert_eq!(options[0].target, Some(StatusId(51)));
}

#[tokio::test]
async fn test_cancelled_edit_saves_nothing() {
  let engine = engine();
  let (intake, _, _, _) = build_informal(&engine).await;

  let cancel = CancellationToken::new();
  cancel.cancel();
  let err = engine
    .insert_option(new_option(intake, None, "Withdraw"), &cancel)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Cancelled);
  assert_eq!(
    engine
      .options_for_status(WorkflowId(1), intake, None)
      .await
      .unwrap()
      .len(),
    1
  );
}

#[tokio::test]
async fn test_import_cannot_drop_a_status_holding_open_cases() {
  let engine = engine();
  let cancel = CancellationToken::new();

  let definition: WorkflowDefinition = serde_json::from_value(json!({
    "workflow": { "workflow_id": 5, "module": 2, "compo": "reserve", "title": "Reserve LOD", "initial_status": 50 },
    "statuses": [
      { "status_id": 50, "workflow_id": 5, "description": "Intake" },
      { "status_id": 51, "workflow_id": 5, "description": "Review" }
    ],
    "options": [
      { "option_id": 500, "status_id": 50, "target": 51, "text": "Forward" },
      { "option_id": 501, "status_id": 51, "text": "Close" }
    ]
  }))
  .unwrap();
  engine
    .import_definition(definition.clone(), &cancel)
    .await
    .unwrap();
  engine
    .start_case(
      &StartCaseRequest {
        ref_id: RefId(900),
        module: ModuleId(2),
        workflow_id: WorkflowId(5),
        actor: Actor::new(UserId(5), "Smith"),
        fields: Default::default(),
      },
      &cancel,
    )
    .await
    .unwrap();

  // Intake now holds the open case and cannot be dropped
  let mut without_intake = definition.clone();
  without_intake.workflow.initial_status = Some(StatusId(51));
  without_intake.statuses.retain(|s| s.status_id != StatusId(50));
  without_intake.options.retain(|o| o.status_id != StatusId(50));
  let err = engine
    .import_definition(without_intake, &cancel)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidDefinition);

  let case = engine.case(RefId(900), ModuleId(2)).await.unwrap();
  assert_eq!(case.status_id, Some(StatusId(50)));
  let options = engine
    .options_for_status(WorkflowId(5), StatusId(50), Some(Compo::Reserve))
    .await
    .unwrap();
  assert_eq!(options.len(), 1);

  // Review is unused, so dropping it is fine
  let mut without_review = definition;
  without_review.statuses.retain(|s| s.status_id != StatusId(51));
  without_review.options.retain(|o| o.status_id != StatusId(51));
  without_review.options[0].target = None;
  let graph = engine
    .import_definition(without_review, &cancel)
    .await
    .unwrap();
  assert_eq!(graph.statuses().len(), 1);
}
