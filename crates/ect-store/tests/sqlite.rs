use std::collections::BTreeMap;

use chrono::Utc;
use ect_config::{
  ActionId, Compo, ModuleId, OptionId, RefId, RuleId, Status, StatusAction, StatusId,
  StatusOption, StatusRule, StatusValidation, TrackingId, UserId, ValidationId, Workflow,
  WorkflowDefinition, WorkflowId,
};
use ect_store::{
  CaseFields, CaseRecord, Error, IdSpace, NewReturn, NewSignature, ReturnKind, SqliteStore,
  Store, TrackingClose, TrackingOpen, TransitionCommit, WorkflowLock,
};
use serde_json::json;

async fn store() -> SqliteStore {
  let store = SqliteStore::in_memory().await.unwrap();
  store.migrate().await.unwrap();
  store
}

fn status(id: i64, description: &str, sort_order: i32) -> Status {
  Status {
    status_id: StatusId(id),
    workflow_id: WorkflowId(1),
    description: description.to_string(),
    labels: BTreeMap::new(),
    sort_order,
    is_board: false,
    is_holding: false,
    is_consult: false,
    owner_group: None,
  }
}

fn option(id: i64, from: i64, to: Option<i64>) -> StatusOption {
  StatusOption {
    option_id: OptionId(id),
    status_id: StatusId(from),
    target: to.map(StatusId),
    text: format!("option {}", id),
    active: true,
    sort_order: 0,
    template_id: None,
    check_all: false,
    cross_workflow: false,
    compos: Vec::new(),
  }
}

fn definition() -> WorkflowDefinition {
  let mut review = status(11, "Wing JA Review", 2);
  review.labels.insert(Compo::Reserve, "ARC JA Review".to_string());
  review.owner_group = Some("wing_ja".to_string());

  let mut approve = option(101, 11, None);
  approve.check_all = true;
  approve.compos = vec![Compo::Active, Compo::Guard];

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
    statuses: vec![status(10, "Unit CC Review", 1), review],
    options: vec![option(100, 10, Some(11)), approve],
    actions: vec![StatusAction {
      action_id: ActionId(1000),
      option_id: OptionId(100),
      action_type: "add_signature".to_string(),
      sort_order: 1,
      data: json!({}),
    }],
    rules: vec![StatusRule {
      rule_id: RuleId(500),
      option_id: OptionId(101),
      rule_type: "require_field".to_string(),
      data: json!({ "field": "finding" }),
    }],
    validations: vec![StatusValidation {
      validation_id: ValidationId(900),
      status_id: StatusId(11),
      validation_type: "require_signature".to_string(),
      data: json!({}),
      active: true,
    }],
  }
}

fn case() -> CaseRecord {
  CaseRecord {
    ref_id: RefId(7),
    module: ModuleId(2),
    workflow_id: WorkflowId(1),
    status_id: Some(StatusId(10)),
    fields: CaseFields::new(),
    created_at: Utc::now(),
    completed_at: None,
  }
}

fn open(status: i64) -> TrackingOpen {
  TrackingOpen {
    ref_id: RefId(7),
    module: ModuleId(2),
    status_id: StatusId(status),
    started_at: Utc::now(),
    started_by: UserId(1),
  }
}

fn close(tracking_id: TrackingId) -> TrackingClose {
  TrackingClose {
    tracking_id,
    ended_at: Utc::now(),
    completed_by: UserId(1),
    completed_by_name: "Capt Smith".to_string(),
  }
}

#[tokio::test]
async fn test_definition_roundtrip() {
  let store = store().await;
  let def = definition();
  store.save_definition(&def).await.unwrap();

  let loaded = store.load_definition(WorkflowId(1)).await.unwrap();
  assert_eq!(loaded, def);

  let found = store.find_status(StatusId(11)).await.unwrap();
  assert_eq!(found.label_for(Compo::Reserve), "ARC JA Review");
  assert_eq!(found.label_for(Compo::Guard), "Wing JA Review");

  assert_eq!(store.next_id(IdSpace::Status).await.unwrap(), 12);
  assert_eq!(store.next_id(IdSpace::Option).await.unwrap(), 102);
  assert_eq!(store.next_id(IdSpace::Validation).await.unwrap(), 901);
}

#[tokio::test]
async fn test_save_definition_replaces_children() {
  let store = store().await;
  let mut def = definition();
  store.save_definition(&def).await.unwrap();

  def.rules.clear();
  def.options.retain(|o| o.option_id == OptionId(100));
  store.save_definition(&def).await.unwrap();

  let loaded = store.load_definition(WorkflowId(1)).await.unwrap();
  assert_eq!(loaded.options.len(), 1);
  assert!(loaded.rules.is_empty());
  assert_eq!(loaded.actions.len(), 1);
}

#[tokio::test]
async fn test_save_definition_rejects_foreign_status() {
  let store = store().await;
  store.save_definition(&definition()).await.unwrap();

  let mut other = WorkflowDefinition::empty(Workflow {
    workflow_id: WorkflowId(2),
    title: "Formal LOD".to_string(),
    ..definition().workflow
  });
  other.statuses.push(Status {
    workflow_id: WorkflowId(2),
    ..status(10, "Stolen", 1)
  });

  let err = store.save_definition(&other).await.unwrap_err();
  assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn test_missing_workflow_is_not_found() {
  let store = store().await;
  assert!(matches!(
    store.load_definition(WorkflowId(42)).await,
    Err(Error::NotFound(_))
  ));
  assert!(matches!(
    store.find_status(StatusId(42)).await,
    Err(Error::NotFound(_))
  ));
}

#[tokio::test]
async fn test_create_case_opens_tracking() {
  let store = store().await;
  store.save_definition(&definition()).await.unwrap();

  let tracking_id = store.create_case(&case(), &open(10)).await.unwrap();
  let current = store
    .current_tracking(RefId(7), ModuleId(2))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(current.tracking_id, tracking_id);
  assert_eq!(current.status_id, StatusId(10));

  let err = store.create_case(&case(), &open(10)).await.unwrap_err();
  assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn test_commit_transition_moves_case() {
  let store = store().await;
  store.save_definition(&definition()).await.unwrap();
  let first = store.create_case(&case(), &open(10)).await.unwrap();

  let mut fields = CaseFields::new();
  fields.insert("finding".to_string(), json!("in_lod"));
  let commit = TransitionCommit {
    ref_id: RefId(7),
    module: ModuleId(2),
    workflow_id: WorkflowId(1),
    close: close(first),
    open: Some(open(11)),
    fields: Some(fields),
    signatures: vec![NewSignature {
      ref_id: RefId(7),
      module: ModuleId(2),
      status_id: StatusId(10),
      user_id: UserId(1),
      name_rank: "Capt Smith".to_string(),
      signed_at: Utc::now(),
    }],
    return_record: None,
  };
  let outcome = store.commit_transition(&commit).await.unwrap();
  assert!(outcome.opened.is_some());
  assert_eq!(outcome.signatures.len(), 1);

  let case = store.get_case(RefId(7), ModuleId(2)).await.unwrap();
  assert_eq!(case.status_id, Some(StatusId(11)));
  assert_eq!(case.fields.get("finding"), Some(&json!("in_lod")));

  let history = store.tracking_history(RefId(7), None).await.unwrap();
  assert_eq!(history.len(), 2);
  assert_eq!(history[0].completed_by_name.as_deref(), Some("Capt Smith"));
  assert!(history[1].is_open());

  // Replaying the same commit finds the row already closed
  let err = store.commit_transition(&commit).await.unwrap_err();
  assert!(matches!(err, Error::Conflict(_)));
  assert_eq!(
    store.tracking_history(RefId(7), None).await.unwrap().len(),
    2
  );
}

#[tokio::test]
async fn test_commit_terminal_completes_case() {
  let store = store().await;
  store.save_definition(&definition()).await.unwrap();
  let first = store.create_case(&case(), &open(10)).await.unwrap();

  store
    .commit_transition(&TransitionCommit {
      ref_id: RefId(7),
      module: ModuleId(2),
      workflow_id: WorkflowId(1),
      close: close(first),
      open: None,
      fields: None,
      signatures: Vec::new(),
      return_record: None,
    })
    .await
    .unwrap();

  let case = store.get_case(RefId(7), ModuleId(2)).await.unwrap();
  assert!(case.is_complete());
  assert_eq!(case.status_id, None);
  assert!(store
    .current_tracking(RefId(7), ModuleId(2))
    .await
    .unwrap()
    .is_none());
}

#[tokio::test]
async fn test_live_statuses_follow_open_cases() {
  let store = store().await;
  store.save_definition(&definition()).await.unwrap();
  assert!(store.live_statuses(WorkflowId(1)).await.unwrap().is_empty());

  let first = store.create_case(&case(), &open(10)).await.unwrap();
  assert_eq!(
    store.live_statuses(WorkflowId(1)).await.unwrap(),
    vec![StatusId(10)]
  );
  assert!(store.live_statuses(WorkflowId(2)).await.unwrap().is_empty());

  store
    .commit_transition(&TransitionCommit {
      ref_id: RefId(7),
      module: ModuleId(2),
      workflow_id: WorkflowId(1),
      close: close(first),
      open: None,
      fields: None,
      signatures: Vec::new(),
      return_record: None,
    })
    .await
    .unwrap();
  assert!(store.live_statuses(WorkflowId(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_commit_records_return() {
  let store = store().await;
  store.save_definition(&definition()).await.unwrap();
  let first = store.create_case(&case(), &open(11)).await.unwrap();

  let outcome = store
    .commit_transition(&TransitionCommit {
      ref_id: RefId(7),
      module: ModuleId(2),
      workflow_id: WorkflowId(1),
      close: close(first),
      open: Some(open(10)),
      fields: None,
      signatures: Vec::new(),
      return_record: Some(NewReturn {
        kind: ReturnKind::Rwoa,
        status_from: StatusId(11),
        status_to: StatusId(10),
        reason: 3,
        explanation: "Missing AF 348".to_string(),
        sent_by: UserId(1),
        sent_by_name: "Capt Smith".to_string(),
        sent_to: Some("unit_cc".to_string()),
        rerouting: true,
        created_at: Utc::now(),
      }),
    })
    .await
    .unwrap();
  assert!(outcome.return_id.is_some());

  let returns = store.list_returns(RefId(7), ModuleId(2)).await.unwrap();
  assert_eq!(returns.len(), 1);
  assert_eq!(returns[0].kind, ReturnKind::Rwoa);
  assert_eq!(returns[0].sent_to.as_deref(), Some("unit_cc"));
  assert!(returns[0].rerouting);
}

#[tokio::test]
async fn test_lock_rows() {
  let store = store().await;
  let lock = WorkflowLock {
    ref_id: RefId(7),
    module: ModuleId(2),
    user_id: UserId(1),
    user_name: "Capt Smith".to_string(),
    acquired_at: Utc::now(),
    operation: None,
  };
  assert_eq!(store.try_insert_lock(&lock).await.unwrap().user_id, UserId(1));

  let other = WorkflowLock {
    user_id: UserId(2),
    user_name: "Maj Jones".to_string(),
    ..lock.clone()
  };
  assert_eq!(store.try_insert_lock(&other).await.unwrap().user_id, UserId(1));
  assert_eq!(store.list_locks().await.unwrap().len(), 1);

  assert!(!store
    .delete_lock(RefId(7), ModuleId(2), Some(UserId(2)))
    .await
    .unwrap());
  assert!(store
    .delete_lock(RefId(7), ModuleId(2), None)
    .await
    .unwrap());
  assert!(store.get_lock(RefId(7), ModuleId(2)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_operation_lock_is_exclusive() {
  let store = store().await;
  let lock = WorkflowLock {
    ref_id: RefId(7),
    module: ModuleId(2),
    user_id: UserId(1),
    user_name: "Capt Smith".to_string(),
    acquired_at: Utc::now(),
    operation: Some("op-1".to_string()),
  };
  let held = store.try_insert_lock(&lock).await.unwrap();
  assert_eq!(held.operation.as_deref(), Some("op-1"));

  // A second operation by the same holder cannot mark a busy lock
  assert!(!store
    .claim_lock(RefId(7), ModuleId(2), UserId(1), "op-2")
    .await
    .unwrap());

  assert!(store
    .finish_claim(RefId(7), ModuleId(2), "op-1", false)
    .await
    .unwrap());
  assert!(store
    .claim_lock(RefId(7), ModuleId(2), UserId(1), "op-2")
    .await
    .unwrap());
  assert!(!store
    .finish_claim(RefId(7), ModuleId(2), "op-1", true)
    .await
    .unwrap());
  assert!(store
    .finish_claim(RefId(7), ModuleId(2), "op-2", true)
    .await
    .unwrap());
  assert!(store.get_lock(RefId(7), ModuleId(2)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_tracking_history_filters_by_module() {
  let store = store().await;
  store.open_tracking(&open(10)).await.unwrap();
  store
    .open_tracking(&TrackingOpen {
      module: ModuleId(5),
      ..open(10)
    })
    .await
    .unwrap();

  assert_eq!(
    store.tracking_history(RefId(7), None).await.unwrap().len(),
    2
  );
  assert_eq!(
    store
      .tracking_history(RefId(7), Some(ModuleId(5)))
      .await
      .unwrap()
      .len(),
    1
  );
}

#[tokio::test]
async fn test_find_option_across_workflows() {
  let store = store().await;
  store.save_definition(&definition()).await.unwrap();

  let found = store.find_option(OptionId(101)).await.unwrap();
  assert_eq!(found.status_id, StatusId(11));
  assert!(found.check_all);
  assert!(matches!(
    store.find_option(OptionId(999)).await,
    Err(Error::NotFound(_))
  ));
}

#[tokio::test]
async fn test_file_database_survives_reconnect() {
  let dir = tempfile::tempdir().unwrap();
  let url = format!("sqlite://{}", dir.path().join("ect.db").display());

  {
    let store = SqliteStore::connect(&url).await.unwrap();
    store.migrate().await.unwrap();
    store.save_definition(&definition()).await.unwrap();
  }

  let store = SqliteStore::connect(&url).await.unwrap();
  store.migrate().await.unwrap();
  assert_eq!(
    store.load_definition(WorkflowId(1)).await.unwrap(),
    definition()
  );
}
