use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ect_config::{
  ActionId, Compo, ModuleId, OptionId, RefId, ReturnId, RuleId, SignatureId, Status,
  StatusAction, StatusId, StatusOption, StatusRule, StatusValidation, TrackingId, UserId,
  ValidationId, Workflow, WorkflowDefinition, WorkflowId,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};

use crate::{
  CaseRecord, CommitOutcome, Error, IdSpace, NewSignature, ReturnKind, ReturnRecord, Signature,
  StatusTracking, Store, TrackingClose, TrackingOpen, TransitionCommit, WorkflowLock,
};

const TRACKING_COLUMNS: &str = "tracking_id, ref_id, module, status_id, started_at, started_by, ended_at, completed_by, completed_by_name";
const LOCK_COLUMNS: &str = "ref_id, module, user_id, user_name, acquired_at, operation";

/// SQLite-based store implementation.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Connect to a database URL, creating the file if needed.
  pub async fn connect(url: &str) -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(Self::new(pool))
  }

  /// A private in-memory database. The pool keeps exactly one connection
  /// alive so the database survives between queries.
  pub async fn in_memory() -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .min_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect_with(options)
      .await?;
    Ok(Self::new(pool))
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::migrate!("../../migrations").run(&self.pool).await?;
    Ok(())
  }

  async fn open_row_in(
    tx: &mut Transaction<'_, Sqlite>,
    ref_id: RefId,
    module: ModuleId,
  ) -> Result<Option<i64>, Error> {
    let id = sqlx::query_scalar(
      "SELECT tracking_id FROM status_tracking WHERE ref_id = ? AND module = ? AND ended_at IS NULL",
    )
    .bind(ref_id.0)
    .bind(module.0)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(id)
  }

  async fn insert_tracking_in(
    tx: &mut Transaction<'_, Sqlite>,
    open: &TrackingOpen,
  ) -> Result<TrackingId, Error> {
    let result = sqlx::query(
      r#"
            INSERT INTO status_tracking (ref_id, module, status_id, started_at, started_by)
            VALUES (?, ?, ?, ?, ?)
            "#,
    )
    .bind(open.ref_id.0)
    .bind(open.module.0)
    .bind(open.status_id.0)
    .bind(open.started_at)
    .bind(open.started_by.0)
    .execute(&mut **tx)
    .await?;
    Ok(TrackingId(result.last_insert_rowid()))
  }

  async fn insert_signature_in(
    tx: &mut Transaction<'_, Sqlite>,
    signature: &NewSignature,
  ) -> Result<SignatureId, Error> {
    let result = sqlx::query(
      r#"
            INSERT INTO signatures (ref_id, module, status_id, user_id, name_rank, signed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(signature.ref_id.0)
    .bind(signature.module.0)
    .bind(signature.status_id.0)
    .bind(signature.user_id.0)
    .bind(&signature.name_rank)
    .bind(signature.signed_at)
    .execute(&mut **tx)
    .await?;
    Ok(SignatureId(result.last_insert_rowid()))
  }
}

fn parse_compo(value: &str) -> Result<Compo, Error> {
  Compo::from_str(value).map_err(|e| Error::InvalidData(e.to_string()))
}

fn workflow_from_row(row: &SqliteRow) -> Result<Workflow, Error> {
  let compo: String = row.try_get("compo")?;
  Ok(Workflow {
    workflow_id: WorkflowId(row.try_get("workflow_id")?),
    module: ModuleId(row.try_get("module")?),
    compo: parse_compo(&compo)?,
    formal: row.try_get("formal")?,
    title: row.try_get("title")?,
    initial_status: row
      .try_get::<Option<i64>, _>("initial_status")?
      .map(StatusId),
    active: row.try_get("active")?,
  })
}

fn status_from_row(row: &SqliteRow) -> Result<Status, Error> {
  let labels: String = row.try_get("labels")?;
  Ok(Status {
    status_id: StatusId(row.try_get("status_id")?),
    workflow_id: WorkflowId(row.try_get("workflow_id")?),
    description: row.try_get("description")?,
    labels: serde_json::from_str(&labels)?,
    sort_order: row.try_get("sort_order")?,
    is_board: row.try_get("is_board")?,
    is_holding: row.try_get("is_holding")?,
    is_consult: row.try_get("is_consult")?,
    owner_group: row.try_get("owner_group")?,
  })
}

fn option_from_row(row: &SqliteRow) -> Result<StatusOption, Error> {
  let compos: String = row.try_get("compos")?;
  Ok(StatusOption {
    option_id: OptionId(row.try_get("option_id")?),
    status_id: StatusId(row.try_get("status_id")?),
    target: row.try_get::<Option<i64>, _>("target")?.map(StatusId),
    text: row.try_get("option_text")?,
    active: row.try_get("active")?,
    sort_order: row.try_get("sort_order")?,
    template_id: row.try_get("template_id")?,
    check_all: row.try_get("check_all")?,
    cross_workflow: row.try_get("cross_workflow")?,
    compos: serde_json::from_str(&compos)?,
  })
}

fn action_from_row(row: &SqliteRow) -> Result<StatusAction, Error> {
  let data: String = row.try_get("data")?;
  Ok(StatusAction {
    action_id: ActionId(row.try_get("action_id")?),
    option_id: OptionId(row.try_get("option_id")?),
    action_type: row.try_get("action_type")?,
    sort_order: row.try_get("sort_order")?,
    data: serde_json::from_str(&data)?,
  })
}

fn rule_from_row(row: &SqliteRow) -> Result<StatusRule, Error> {
  let data: String = row.try_get("data")?;
  Ok(StatusRule {
    rule_id: RuleId(row.try_get("rule_id")?),
    option_id: OptionId(row.try_get("option_id")?),
    rule_type: row.try_get("rule_type")?,
    data: serde_json::from_str(&data)?,
  })
}

fn validation_from_row(row: &SqliteRow) -> Result<StatusValidation, Error> {
  let data: String = row.try_get("data")?;
  Ok(StatusValidation {
    validation_id: ValidationId(row.try_get("validation_id")?),
    status_id: StatusId(row.try_get("status_id")?),
    validation_type: row.try_get("validation_type")?,
    data: serde_json::from_str(&data)?,
    active: row.try_get("active")?,
  })
}

fn case_from_row(row: &SqliteRow) -> Result<CaseRecord, Error> {
  let fields: String = row.try_get("fields")?;
  Ok(CaseRecord {
    ref_id: RefId(row.try_get("ref_id")?),
    module: ModuleId(row.try_get("module")?),
    workflow_id: WorkflowId(row.try_get("workflow_id")?),
    status_id: row.try_get::<Option<i64>, _>("status_id")?.map(StatusId),
    fields: serde_json::from_str(&fields)?,
    created_at: row.try_get("created_at")?,
    completed_at: row.try_get("completed_at")?,
  })
}

fn tracking_from_row(row: &SqliteRow) -> Result<StatusTracking, Error> {
  Ok(StatusTracking {
    tracking_id: TrackingId(row.try_get("tracking_id")?),
    ref_id: RefId(row.try_get("ref_id")?),
    module: ModuleId(row.try_get("module")?),
    status_id: StatusId(row.try_get("status_id")?),
    started_at: row.try_get("started_at")?,
    started_by: UserId(row.try_get("started_by")?),
    ended_at: row.try_get("ended_at")?,
    completed_by: row.try_get::<Option<i64>, _>("completed_by")?.map(UserId),
    completed_by_name: row.try_get("completed_by_name")?,
  })
}

fn lock_from_row(row: &SqliteRow) -> Result<WorkflowLock, Error> {
  Ok(WorkflowLock {
    ref_id: RefId(row.try_get("ref_id")?),
    module: ModuleId(row.try_get("module")?),
    user_id: UserId(row.try_get("user_id")?),
    user_name: row.try_get("user_name")?,
    acquired_at: row.try_get("acquired_at")?,
    operation: row.try_get("operation")?,
  })
}

fn signature_from_row(row: &SqliteRow) -> Result<Signature, Error> {
  Ok(Signature {
    signature_id: SignatureId(row.try_get("signature_id")?),
    ref_id: RefId(row.try_get("ref_id")?),
    module: ModuleId(row.try_get("module")?),
    status_id: StatusId(row.try_get("status_id")?),
    user_id: UserId(row.try_get("user_id")?),
    name_rank: row.try_get("name_rank")?,
    signed_at: row.try_get("signed_at")?,
  })
}

fn return_from_row(row: &SqliteRow) -> Result<ReturnRecord, Error> {
  let kind: String = row.try_get("kind")?;
  Ok(ReturnRecord {
    return_id: ReturnId(row.try_get("return_id")?),
    ref_id: RefId(row.try_get("ref_id")?),
    module: ModuleId(row.try_get("module")?),
    kind: ReturnKind::from_str(&kind).map_err(Error::InvalidData)?,
    status_from: StatusId(row.try_get("status_from")?),
    status_to: StatusId(row.try_get("status_to")?),
    reason: row.try_get("reason")?,
    explanation: row.try_get("explanation")?,
    sent_by: UserId(row.try_get("sent_by")?),
    sent_by_name: row.try_get("sent_by_name")?,
    sent_to: row.try_get("sent_to")?,
    rerouting: row.try_get("rerouting")?,
    created_at: row.try_get("created_at")?,
  })
}

#[async_trait]
impl Store for SqliteStore {
  async fn create_workflow(&self, workflow: &Workflow) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
            INSERT INTO workflows (workflow_id, module, compo, formal, title, initial_status, active)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(workflow_id) DO NOTHING
            "#,
    )
    .bind(workflow.workflow_id.0)
    .bind(workflow.module.0)
    .bind(workflow.compo.as_str())
    .bind(workflow.formal)
    .bind(&workflow.title)
    .bind(workflow.initial_status.map(|s| s.0))
    .bind(workflow.active)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(Error::Conflict(format!(
        "workflow {} already exists",
        workflow.workflow_id
      )));
    }
    Ok(())
  }

  async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, Error> {
    let row = sqlx::query(
      r#"
            SELECT workflow_id, module, compo, formal, title, initial_status, active
            FROM workflows
            WHERE workflow_id = ?
            "#,
    )
    .bind(workflow_id.0)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("workflow {}", workflow_id)))?;
    workflow_from_row(&row)
  }

  async fn list_workflows(&self) -> Result<Vec<Workflow>, Error> {
    let rows = sqlx::query(
      r#"
            SELECT workflow_id, module, compo, formal, title, initial_status, active
            FROM workflows
            ORDER BY workflow_id ASC
            "#,
    )
    .fetch_all(&self.pool)
    .await?;
    rows.iter().map(workflow_from_row).collect()
  }

  async fn load_definition(&self, workflow_id: WorkflowId) -> Result<WorkflowDefinition, Error> {
    let workflow = self.get_workflow(workflow_id).await?;

    let statuses = sqlx::query(
      r#"
            SELECT status_id, workflow_id, description, labels, sort_order, is_board, is_holding, is_consult, owner_group
            FROM statuses
            WHERE workflow_id = ?
            ORDER BY sort_order ASC, status_id ASC
            "#,
    )
    .bind(workflow_id.0)
    .fetch_all(&self.pool)
    .await?
    .iter()
    .map(status_from_row)
    .collect::<Result<Vec<_>, _>>()?;

    let options = sqlx::query(
      r#"
            SELECT o.option_id, o.status_id, o.target, o.option_text, o.active, o.sort_order,
                   o.template_id, o.check_all, o.cross_workflow, o.compos
            FROM status_options o
            JOIN statuses s ON s.status_id = o.status_id
            WHERE s.workflow_id = ?
            ORDER BY o.option_id ASC
            "#,
    )
    .bind(workflow_id.0)
    .fetch_all(&self.pool)
    .await?
    .iter()
    .map(option_from_row)
    .collect::<Result<Vec<_>, _>>()?;

    let actions = sqlx::query(
      r#"
            SELECT a.action_id, a.option_id, a.action_type, a.sort_order, a.data
            FROM status_actions a
            JOIN status_options o ON o.option_id = a.option_id
            JOIN statuses s ON s.status_id = o.status_id
            WHERE s.workflow_id = ?
            ORDER BY a.action_id ASC
            "#,
    )
    .bind(workflow_id.0)
    .fetch_all(&self.pool)
    .await?
    .iter()
    .map(action_from_row)
    .collect::<Result<Vec<_>, _>>()?;

    let rules = sqlx::query(
      r#"
            SELECT r.rule_id, r.option_id, r.rule_type, r.data
            FROM status_rules r
            JOIN status_options o ON o.option_id = r.option_id
            JOIN statuses s ON s.status_id = o.status_id
            WHERE s.workflow_id = ?
            ORDER BY r.rule_id ASC
            "#,
    )
    .bind(workflow_id.0)
    .fetch_all(&self.pool)
    .await?
    .iter()
    .map(rule_from_row)
    .collect::<Result<Vec<_>, _>>()?;

    let validations = sqlx::query(
      r#"
            SELECT v.validation_id, v.status_id, v.validation_type, v.data, v.active
            FROM status_validations v
            JOIN statuses s ON s.status_id = v.status_id
            WHERE s.workflow_id = ?
            ORDER BY v.validation_id ASC
            "#,
    )
    .bind(workflow_id.0)
    .fetch_all(&self.pool)
    .await?
    .iter()
    .map(validation_from_row)
    .collect::<Result<Vec<_>, _>>()?;

    Ok(WorkflowDefinition {
      workflow,
      statuses,
      options,
      actions,
      rules,
      validations,
    })
  }

  async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), Error> {
    let workflow = &definition.workflow;
    let mut tx = self.pool.begin().await?;

    for status in &definition.statuses {
      let owner: Option<i64> =
        sqlx::query_scalar("SELECT workflow_id FROM statuses WHERE status_id = ?")
          .bind(status.status_id.0)
          .fetch_optional(&mut *tx)
          .await?;
      if let Some(owner) = owner
        && owner != workflow.workflow_id.0
      {
        return Err(Error::Conflict(format!(
          "status {} already belongs to workflow {}",
          status.status_id, owner
        )));
      }
    }

    sqlx::query(
      r#"
            INSERT INTO workflows (workflow_id, module, compo, formal, title, initial_status, active)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(workflow_id) DO UPDATE SET
              module = excluded.module,
              compo = excluded.compo,
              formal = excluded.formal,
              title = excluded.title,
              initial_status = excluded.initial_status,
              active = excluded.active
            "#,
    )
    .bind(workflow.workflow_id.0)
    .bind(workflow.module.0)
    .bind(workflow.compo.as_str())
    .bind(workflow.formal)
    .bind(&workflow.title)
    .bind(workflow.initial_status.map(|s| s.0))
    .bind(workflow.active)
    .execute(&mut *tx)
    .await?;

    let owned_options = "SELECT o.option_id FROM status_options o JOIN statuses s ON s.status_id = o.status_id WHERE s.workflow_id = ?";
    for table in ["status_actions", "status_rules"] {
      sqlx::query(&format!(
        "DELETE FROM {} WHERE option_id IN ({})",
        table, owned_options
      ))
      .bind(workflow.workflow_id.0)
      .execute(&mut *tx)
      .await?;
    }
    sqlx::query(
      "DELETE FROM status_options WHERE status_id IN (SELECT status_id FROM statuses WHERE workflow_id = ?)",
    )
    .bind(workflow.workflow_id.0)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
      "DELETE FROM status_validations WHERE status_id IN (SELECT status_id FROM statuses WHERE workflow_id = ?)",
    )
    .bind(workflow.workflow_id.0)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM statuses WHERE workflow_id = ?")
      .bind(workflow.workflow_id.0)
      .execute(&mut *tx)
      .await?;

    for status in &definition.statuses {
      sqlx::query(
        r#"
            INSERT INTO statuses (status_id, workflow_id, description, labels, sort_order, is_board, is_holding, is_consult, owner_group)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
      )
      .bind(status.status_id.0)
      .bind(status.workflow_id.0)
      .bind(&status.description)
      .bind(serde_json::to_string(&status.labels)?)
      .bind(status.sort_order)
      .bind(status.is_board)
      .bind(status.is_holding)
      .bind(status.is_consult)
      .bind(&status.owner_group)
      .execute(&mut *tx)
      .await?;
    }

    for option in &definition.options {
      sqlx::query(
        r#"
            INSERT INTO status_options (option_id, status_id, target, option_text, active, sort_order, template_id, check_all, cross_workflow, compos)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
      )
      .bind(option.option_id.0)
      .bind(option.status_id.0)
      .bind(option.target.map(|t| t.0))
      .bind(&option.text)
      .bind(option.active)
      .bind(option.sort_order)
      .bind(option.template_id)
      .bind(option.check_all)
      .bind(option.cross_workflow)
      .bind(serde_json::to_string(&option.compos)?)
      .execute(&mut *tx)
      .await?;
    }

    for action in &definition.actions {
      sqlx::query(
        r#"
            INSERT INTO status_actions (action_id, option_id, action_type, sort_order, data)
            VALUES (?, ?, ?, ?, ?)
            "#,
      )
      .bind(action.action_id.0)
      .bind(action.option_id.0)
      .bind(&action.action_type)
      .bind(action.sort_order)
      .bind(serde_json::to_string(&action.data)?)
      .execute(&mut *tx)
      .await?;
    }

    for rule in &definition.rules {
      sqlx::query(
        r#"
            INSERT INTO status_rules (rule_id, option_id, rule_type, data)
            VALUES (?, ?, ?, ?)
            "#,
      )
      .bind(rule.rule_id.0)
      .bind(rule.option_id.0)
      .bind(&rule.rule_type)
      .bind(serde_json::to_string(&rule.data)?)
      .execute(&mut *tx)
      .await?;
    }

    for validation in &definition.validations {
      sqlx::query(
        r#"
            INSERT INTO status_validations (validation_id, status_id, validation_type, data, active)
            VALUES (?, ?, ?, ?, ?)
            "#,
      )
      .bind(validation.validation_id.0)
      .bind(validation.status_id.0)
      .bind(&validation.validation_type)
      .bind(serde_json::to_string(&validation.data)?)
      .bind(validation.active)
      .execute(&mut *tx)
      .await?;
    }

    tx.commit().await?;
    Ok(())
  }

  async fn find_status(&self, status_id: StatusId) -> Result<Status, Error> {
    let row = sqlx::query(
      r#"
            SELECT status_id, workflow_id, description, labels, sort_order, is_board, is_holding, is_consult, owner_group
            FROM statuses
            WHERE status_id = ?
            "#,
    )
    .bind(status_id.0)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("status {}", status_id)))?;
    status_from_row(&row)
  }

  async fn find_option(&self, option_id: OptionId) -> Result<StatusOption, Error> {
    let row = sqlx::query(
      r#"
            SELECT option_id, status_id, target, option_text, active, sort_order,
                   template_id, check_all, cross_workflow, compos
            FROM status_options
            WHERE option_id = ?
            "#,
    )
    .bind(option_id.0)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("option {}", option_id)))?;
    option_from_row(&row)
  }

  async fn live_statuses(&self, workflow_id: WorkflowId) -> Result<Vec<StatusId>, Error> {
    let ids: Vec<i64> = sqlx::query_scalar(
      r#"
            SELECT status_id FROM cases
            WHERE completed_at IS NULL
              AND status_id IN (SELECT status_id FROM statuses WHERE workflow_id = ?)
            UNION
            SELECT status_id FROM status_tracking
            WHERE ended_at IS NULL
              AND status_id IN (SELECT status_id FROM statuses WHERE workflow_id = ?)
            ORDER BY status_id ASC
            "#,
    )
    .bind(workflow_id.0)
    .bind(workflow_id.0)
    .fetch_all(&self.pool)
    .await?;
    Ok(ids.into_iter().map(StatusId).collect())
  }

  async fn next_id(&self, space: IdSpace) -> Result<i64, Error> {
    let (column, table) = match space {
      IdSpace::Workflow => ("workflow_id", "workflows"),
      IdSpace::Status => ("status_id", "statuses"),
      IdSpace::Option => ("option_id", "status_options"),
      IdSpace::Action => ("action_id", "status_actions"),
      IdSpace::Rule => ("rule_id", "status_rules"),
      IdSpace::Validation => ("validation_id", "status_validations"),
    };
    let next: i64 = sqlx::query_scalar(&format!(
      "SELECT COALESCE(MAX({}), 0) + 1 FROM {}",
      column, table
    ))
    .fetch_one(&self.pool)
    .await?;
    Ok(next)
  }

  async fn create_case(&self, case: &CaseRecord, open: &TrackingOpen) -> Result<TrackingId, Error> {
    let mut tx = self.pool.begin().await?;

    let result = sqlx::query(
      r#"
            INSERT INTO cases (ref_id, module, workflow_id, status_id, fields, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(ref_id, module) DO NOTHING
            "#,
    )
    .bind(case.ref_id.0)
    .bind(case.module.0)
    .bind(case.workflow_id.0)
    .bind(case.status_id.map(|s| s.0))
    .bind(serde_json::to_string(&case.fields)?)
    .bind(case.created_at)
    .bind(case.completed_at)
    .execute(&mut *tx)
    .await?;
    if result.rows_affected() == 0 {
      return Err(Error::Conflict(format!(
        "case {} (module {}) already exists",
        case.ref_id, case.module
      )));
    }

    if Self::open_row_in(&mut tx, case.ref_id, case.module)
      .await?
      .is_some()
    {
      return Err(Error::Conflict(format!(
        "case {} (module {}) already has an open tracking row",
        case.ref_id, case.module
      )));
    }
    let tracking_id = Self::insert_tracking_in(&mut tx, open).await?;

    tx.commit().await?;
    Ok(tracking_id)
  }

  async fn get_case(&self, ref_id: RefId, module: ModuleId) -> Result<CaseRecord, Error> {
    let row = sqlx::query(
      r#"
            SELECT ref_id, module, workflow_id, status_id, fields, created_at, completed_at
            FROM cases
            WHERE ref_id = ? AND module = ?
            "#,
    )
    .bind(ref_id.0)
    .bind(module.0)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("case {} (module {})", ref_id, module)))?;
    case_from_row(&row)
  }

  async fn open_tracking(&self, open: &TrackingOpen) -> Result<TrackingId, Error> {
    let mut tx = self.pool.begin().await?;
    if Self::open_row_in(&mut tx, open.ref_id, open.module)
      .await?
      .is_some()
    {
      return Err(Error::Conflict(format!(
        "case {} (module {}) already has an open tracking row",
        open.ref_id, open.module
      )));
    }
    let tracking_id = Self::insert_tracking_in(&mut tx, open).await?;
    tx.commit().await?;
    Ok(tracking_id)
  }

  async fn close_tracking(&self, close: &TrackingClose) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;
    let ended_at: Option<Option<DateTime<Utc>>> =
      sqlx::query_scalar("SELECT ended_at FROM status_tracking WHERE tracking_id = ?")
        .bind(close.tracking_id.0)
        .fetch_optional(&mut *tx)
        .await?;
    match ended_at {
      None => {
        return Err(Error::NotFound(format!(
          "tracking row {}",
          close.tracking_id
        )));
      }
      Some(Some(_)) => {
        return Err(Error::Conflict(format!(
          "tracking row {} is already closed",
          close.tracking_id
        )));
      }
      Some(None) => {}
    }

    sqlx::query(
      r#"
            UPDATE status_tracking
            SET ended_at = ?, completed_by = ?, completed_by_name = ?
            WHERE tracking_id = ? AND ended_at IS NULL
            "#,
    )
    .bind(close.ended_at)
    .bind(close.completed_by.0)
    .bind(&close.completed_by_name)
    .bind(close.tracking_id.0)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
  }

  async fn current_tracking(
    &self,
    ref_id: RefId,
    module: ModuleId,
  ) -> Result<Option<StatusTracking>, Error> {
    let row = sqlx::query(&format!(
      "SELECT {} FROM status_tracking WHERE ref_id = ? AND module = ? AND ended_at IS NULL",
      TRACKING_COLUMNS
    ))
    .bind(ref_id.0)
    .bind(module.0)
    .fetch_optional(&self.pool)
    .await?;
    row.as_ref().map(tracking_from_row).transpose()
  }

  async fn tracking_history(
    &self,
    ref_id: RefId,
    module: Option<ModuleId>,
  ) -> Result<Vec<StatusTracking>, Error> {
    let module = module.map(|m| m.0);
    let rows = sqlx::query(&format!(
      "SELECT {} FROM status_tracking WHERE ref_id = ? AND (? IS NULL OR module = ?) ORDER BY tracking_id ASC",
      TRACKING_COLUMNS
    ))
    .bind(ref_id.0)
    .bind(module)
    .bind(module)
    .fetch_all(&self.pool)
    .await?;
    rows.iter().map(tracking_from_row).collect()
  }

  async fn commit_transition(&self, commit: &TransitionCommit) -> Result<CommitOutcome, Error> {
    let mut tx = self.pool.begin().await?;

    let closed = sqlx::query(
      r#"
            UPDATE status_tracking
            SET ended_at = ?, completed_by = ?, completed_by_name = ?
            WHERE tracking_id = ? AND ref_id = ? AND module = ? AND ended_at IS NULL
            "#,
    )
    .bind(commit.close.ended_at)
    .bind(commit.close.completed_by.0)
    .bind(&commit.close.completed_by_name)
    .bind(commit.close.tracking_id.0)
    .bind(commit.ref_id.0)
    .bind(commit.module.0)
    .execute(&mut *tx)
    .await?;
    if closed.rows_affected() != 1 {
      return Err(Error::Conflict(format!(
        "tracking row {} is no longer open",
        commit.close.tracking_id
      )));
    }

    let mut outcome = CommitOutcome::default();
    if let Some(open) = &commit.open {
      outcome.opened = Some(Self::insert_tracking_in(&mut tx, open).await?);
    }

    let completed_at = match commit.open {
      Some(_) => None,
      None => Some(commit.close.ended_at),
    };
    let fields = commit
      .fields
      .as_ref()
      .map(serde_json::to_string)
      .transpose()?;
    let updated = sqlx::query(
      r#"
            UPDATE cases
            SET workflow_id = ?, status_id = ?, completed_at = ?, fields = COALESCE(?, fields)
            WHERE ref_id = ? AND module = ?
            "#,
    )
    .bind(commit.workflow_id.0)
    .bind(commit.open.as_ref().map(|o| o.status_id.0))
    .bind(completed_at)
    .bind(fields)
    .bind(commit.ref_id.0)
    .bind(commit.module.0)
    .execute(&mut *tx)
    .await?;
    if updated.rows_affected() == 0 {
      return Err(Error::NotFound(format!(
        "case {} (module {})",
        commit.ref_id, commit.module
      )));
    }

    for signature in &commit.signatures {
      let id = Self::insert_signature_in(&mut tx, signature).await?;
      outcome.signatures.push(id);
    }

    if let Some(ret) = &commit.return_record {
      let result = sqlx::query(
        r#"
            INSERT INTO returns (ref_id, module, kind, status_from, status_to, reason, explanation, sent_by, sent_by_name, sent_to, rerouting, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
      )
      .bind(commit.ref_id.0)
      .bind(commit.module.0)
      .bind(ret.kind.as_str())
      .bind(ret.status_from.0)
      .bind(ret.status_to.0)
      .bind(ret.reason)
      .bind(&ret.explanation)
      .bind(ret.sent_by.0)
      .bind(&ret.sent_by_name)
      .bind(&ret.sent_to)
      .bind(ret.rerouting)
      .bind(ret.created_at)
      .execute(&mut *tx)
      .await?;
      outcome.return_id = Some(ReturnId(result.last_insert_rowid()));
    }

    tx.commit().await?;
    Ok(outcome)
  }

  async fn try_insert_lock(&self, lock: &WorkflowLock) -> Result<WorkflowLock, Error> {
    sqlx::query(
      r#"
            INSERT INTO workflow_locks (ref_id, module, user_id, user_name, acquired_at, operation)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(ref_id, module) DO NOTHING
            "#,
    )
    .bind(lock.ref_id.0)
    .bind(lock.module.0)
    .bind(lock.user_id.0)
    .bind(&lock.user_name)
    .bind(lock.acquired_at)
    .bind(&lock.operation)
    .execute(&self.pool)
    .await?;

    self
      .get_lock(lock.ref_id, lock.module)
      .await?
      .ok_or_else(|| Error::NotFound(format!("lock on case {}", lock.ref_id)))
  }

  async fn get_lock(&self, ref_id: RefId, module: ModuleId) -> Result<Option<WorkflowLock>, Error> {
    let row = sqlx::query(&format!(
      "SELECT {} FROM workflow_locks WHERE ref_id = ? AND module = ?",
      LOCK_COLUMNS
    ))
    .bind(ref_id.0)
    .bind(module.0)
    .fetch_optional(&self.pool)
    .await?;
    row.as_ref().map(lock_from_row).transpose()
  }

  async fn delete_lock(
    &self,
    ref_id: RefId,
    module: ModuleId,
    holder: Option<UserId>,
  ) -> Result<bool, Error> {
    let holder = holder.map(|u| u.0);
    let result = sqlx::query(
      "DELETE FROM workflow_locks WHERE ref_id = ? AND module = ? AND (? IS NULL OR user_id = ?)",
    )
    .bind(ref_id.0)
    .bind(module.0)
    .bind(holder)
    .bind(holder)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn claim_lock(
    &self,
    ref_id: RefId,
    module: ModuleId,
    user_id: UserId,
    operation: &str,
  ) -> Result<bool, Error> {
    let result = sqlx::query(
      r#"
            UPDATE workflow_locks
            SET operation = ?
            WHERE ref_id = ? AND module = ? AND user_id = ? AND operation IS NULL
            "#,
    )
    .bind(operation)
    .bind(ref_id.0)
    .bind(module.0)
    .bind(user_id.0)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() == 1)
  }

  async fn finish_claim(
    &self,
    ref_id: RefId,
    module: ModuleId,
    operation: &str,
    remove: bool,
  ) -> Result<bool, Error> {
    let sql = if remove {
      "DELETE FROM workflow_locks WHERE ref_id = ? AND module = ? AND operation = ?"
    } else {
      "UPDATE workflow_locks SET operation = NULL WHERE ref_id = ? AND module = ? AND operation = ?"
    };
    let result = sqlx::query(sql)
      .bind(ref_id.0)
      .bind(module.0)
      .bind(operation)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn list_locks(&self) -> Result<Vec<WorkflowLock>, Error> {
    let rows = sqlx::query(&format!(
      "SELECT {} FROM workflow_locks ORDER BY acquired_at ASC",
      LOCK_COLUMNS
    ))
    .fetch_all(&self.pool)
    .await?;
    rows.iter().map(lock_from_row).collect()
  }

  async fn add_signature(&self, signature: &NewSignature) -> Result<SignatureId, Error> {
    let mut tx = self.pool.begin().await?;
    let id = Self::insert_signature_in(&mut tx, signature).await?;
    tx.commit().await?;
    Ok(id)
  }

  async fn list_signatures(&self, ref_id: RefId, module: ModuleId) -> Result<Vec<Signature>, Error> {
    let rows = sqlx::query(
      r#"
            SELECT signature_id, ref_id, module, status_id, user_id, name_rank, signed_at
            FROM signatures
            WHERE ref_id = ? AND module = ?
            ORDER BY signature_id ASC
            "#,
    )
    .bind(ref_id.0)
    .bind(module.0)
    .fetch_all(&self.pool)
    .await?;
    rows.iter().map(signature_from_row).collect()
  }

  async fn list_returns(&self, ref_id: RefId, module: ModuleId) -> Result<Vec<ReturnRecord>, Error> {
    let rows = sqlx::query(
      r#"
            SELECT return_id, ref_id, module, kind, status_from, status_to, reason, explanation,
                   sent_by, sent_by_name, sent_to, rerouting, created_at
            FROM returns
            WHERE ref_id = ? AND module = ?
            ORDER BY return_id ASC
            "#,
    )
    .bind(ref_id.0)
    .bind(module.0)
    .fetch_all(&self.pool)
    .await?;
    rows.iter().map(return_from_row).collect()
  }
}
