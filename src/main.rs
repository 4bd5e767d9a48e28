use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use ect_config::{
  Compo, EngineConfig, ModuleId, OptionId, RefId, StatusId, UserId, Workflow, WorkflowDefinition,
  WorkflowId,
};
use ect_engine::{Actor, Engine, ReturnRequest, StartCaseRequest, TransitionRequest};
use ect_service::WorkflowService;
use ect_store::{CaseFields, ReturnKind, SqliteStore};

/// ECT - configurable case workflow engine
#[derive(Parser)]
#[command(name = "ect")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.ect)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Database URL (overrides the config file)
  #[arg(long, global = true)]
  database: Option<String>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Args, Clone)]
struct ActorArgs {
  /// Acting user id
  #[arg(long)]
  user: i64,

  /// Acting user's name
  #[arg(long)]
  name: String,

  #[arg(long)]
  rank: Option<String>,

  /// Group membership, repeatable
  #[arg(long = "group")]
  groups: Vec<String>,
}

impl ActorArgs {
  fn actor(&self) -> Actor {
    let mut actor = Actor::new(UserId(self.user), &self.name);
    actor.rank = self.rank.clone();
    actor.groups = self.groups.iter().cloned().collect();
    actor
  }
}

#[derive(Subcommand)]
enum Commands {
  /// Create or upgrade the database schema
  Migrate,

  /// Import (replace) a workflow definition from a JSON file
  Import {
    /// Path to the definition file
    definition_file: PathBuf,
  },

  /// List a workflow's steps, or the steps offered at one status
  Steps {
    workflow_id: i64,

    #[arg(long)]
    status: Option<i64>,

    /// Component to filter for (active, reserve, guard)
    #[arg(long)]
    compo: Option<Compo>,
  },

  /// List the actions of a step
  Actions { option_id: i64 },

  /// Start a case at its workflow's initial status (case fields as JSON on stdin)
  Start {
    ref_id: i64,
    module: i64,
    workflow_id: i64,

    #[command(flatten)]
    actor: ActorArgs,
  },

  /// Move a case along a step
  Transition {
    ref_id: i64,
    module: i64,
    option_id: i64,

    #[command(flatten)]
    actor: ActorArgs,
  },

  /// Return a case to an earlier status
  Return {
    ref_id: i64,
    module: i64,
    /// Status to return to
    target: i64,

    /// return or rwoa
    #[arg(long, default_value = "return")]
    kind: ReturnKind,

    #[arg(long)]
    reason: i32,

    #[arg(long)]
    explanation: String,

    /// Recipient group
    #[arg(long)]
    sent_to: Option<String>,

    #[command(flatten)]
    actor: ActorArgs,
  },

  /// Record a signature at the case's current status
  Sign {
    ref_id: i64,
    module: i64,

    #[command(flatten)]
    actor: ActorArgs,
  },

  /// Show a case's status history
  History {
    ref_id: i64,

    #[arg(long)]
    module: Option<i64>,
  },

  /// Inspect and clear case locks
  Locks {
    #[command(subcommand)]
    command: LockCommand,
  },

  /// Copy a workflow into an empty workflow
  CopyWorkflow {
    from: i64,
    to: i64,

    /// Create the target workflow with this title first
    #[arg(long)]
    title: Option<String>,
  },

  /// Append one step's actions onto another
  CopyActions { src: i64, dest: i64 },

  /// Append one step's rules onto another
  CopyRules { src: i64, dest: i64 },
}

#[derive(Subcommand)]
enum LockCommand {
  /// List every lock with its age
  List,

  /// Release your own lock
  Release {
    ref_id: i64,
    module: i64,

    #[arg(long)]
    user: i64,
  },

  /// Remove a lock whoever holds it
  Clear { ref_id: i64, module: i64 },

  /// Remove locks older than the configured threshold
  ClearStale,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let data_dir = match cli.data_dir.clone() {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".ect"),
  };
  let config = EngineConfig::load_or_default(&data_dir.join("config.json"))
    .context("failed to load engine config")?;

  init_tracing(&config.log_level);

  let Some(command) = cli.command else {
    println!("ect - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run(command, cli.database, data_dir, config).await })
}

fn init_tracing(default_level: &str) {
  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
    .init();
}

async fn open_store(
  database: Option<String>,
  data_dir: &Path,
  config: &EngineConfig,
) -> Result<SqliteStore> {
  let url = match database.or_else(|| config.database_url.clone()) {
    Some(url) => url,
    None => {
      tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
      format!("sqlite://{}", data_dir.join("ect.db").display())
    }
  };

  let store = SqliteStore::connect(&url)
    .await
    .with_context(|| format!("failed to open database: {}", url))?;
  Ok(store)
}

async fn run(
  command: Commands,
  database: Option<String>,
  data_dir: PathBuf,
  config: EngineConfig,
) -> Result<()> {
  let store = open_store(database, &data_dir, &config).await?;

  if let Commands::Migrate = command {
    store.migrate().await.context("failed to run migrations")?;
    info!("database schema is up to date");
    return Ok(());
  }

  let engine = Engine::new(Arc::new(store), &config);
  let service = WorkflowService::new(Arc::new(engine));

  // Ctrl-C cancels the in-flight request
  let cancel = CancellationToken::new();
  {
    let cancel = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        cancel.cancel();
      }
    });
  }

  match command {
    Commands::Migrate => Ok(()),
    Commands::Import { definition_file } => {
      let content = tokio::fs::read_to_string(&definition_file)
        .await
        .with_context(|| format!("failed to read definition file: {}", definition_file.display()))?;
      let definition: WorkflowDefinition = serde_json::from_str(&content).with_context(|| {
        format!("failed to parse definition file: {}", definition_file.display())
      })?;
      let saved = service
        .import_definition(definition, &cancel)
        .await
        .context("failed to import workflow definition")?;
      eprintln!(
        "Imported workflow {} ({} statuses, {} options)",
        saved.workflow.workflow_id,
        saved.statuses.len(),
        saved.options.len()
      );
      Ok(())
    }
    Commands::Steps {
      workflow_id,
      status,
      compo,
    } => {
      let steps = match status {
        Some(status_id) => {
          service
            .get_steps_by_workflow_and_status(
              WorkflowId(workflow_id),
              StatusId(status_id),
              compo,
              &cancel,
            )
            .await
        }
        None => {
          service
            .get_steps_by_workflow(WorkflowId(workflow_id), &cancel)
            .await
        }
      }
      .context("failed to list steps")?;
      print_json(&steps)
    }
    Commands::Actions { option_id } => {
      let actions = service
        .get_actions_by_step(OptionId(option_id), &cancel)
        .await
        .context("failed to list actions")?;
      print_json(&actions)
    }
    Commands::Start {
      ref_id,
      module,
      workflow_id,
      actor,
    } => {
      let request = StartCaseRequest {
        ref_id: RefId(ref_id),
        module: ModuleId(module),
        workflow_id: WorkflowId(workflow_id),
        actor: actor.actor(),
        fields: read_fields_from_stdin()?,
      };
      let outcome = service
        .start_case(&request, &cancel)
        .await
        .context("failed to start case")?;
      print_json(&outcome)
    }
    Commands::Transition {
      ref_id,
      module,
      option_id,
      actor,
    } => {
      let request = TransitionRequest {
        ref_id: RefId(ref_id),
        module: ModuleId(module),
        option_id: OptionId(option_id),
        actor: actor.actor(),
      };
      match service.transition(&request, &cancel).await {
        Ok(outcome) => print_json(&outcome),
        Err(e) => {
          // Keep the failing checks and lock holder visible
          print_json(&e)?;
          Err(e).context("transition rejected")
        }
      }
    }
    Commands::Return {
      ref_id,
      module,
      target,
      kind,
      reason,
      explanation,
      sent_to,
      actor,
    } => {
      let request = ReturnRequest {
        ref_id: RefId(ref_id),
        module: ModuleId(module),
        kind,
        target: StatusId(target),
        reason,
        explanation,
        sent_to,
        actor: actor.actor(),
      };
      let outcome = service
        .return_case(&request, &cancel)
        .await
        .context("failed to return case")?;
      print_json(&outcome)
    }
    Commands::Sign {
      ref_id,
      module,
      actor,
    } => {
      let signature_id = service
        .add_signature(RefId(ref_id), ModuleId(module), &actor.actor(), &cancel)
        .await
        .context("failed to record signature")?;
      print_json(&signature_id)
    }
    Commands::History { ref_id, module } => {
      let rows = match module {
        Some(module) => {
          service
            .get_workstatuses_by_ref_id_and_type(RefId(ref_id), ModuleId(module), &cancel)
            .await
        }
        None => {
          service
            .get_workstatuses_by_ref_id(RefId(ref_id), &cancel)
            .await
        }
      }
      .context("failed to load history")?;
      print_json(&rows)
    }
    Commands::Locks { command } => match command {
      LockCommand::List => {
        let locks = service
          .get_all_locks(&cancel)
          .await
          .context("failed to list locks")?;
        print_json(&locks)
      }
      LockCommand::Release {
        ref_id,
        module,
        user,
      } => {
        let released = service
          .release_lock(RefId(ref_id), ModuleId(module), UserId(user), &cancel)
          .await
          .context("failed to release lock")?;
        print_json(&released)
      }
      LockCommand::Clear { ref_id, module } => {
        let cleared = service
          .clear_lock(RefId(ref_id), ModuleId(module), &cancel)
          .await
          .context("failed to clear lock")?;
        print_json(&cleared)
      }
      LockCommand::ClearStale => {
        let cleared = service
          .clear_stale_locks(&cancel)
          .await
          .context("failed to clear stale locks")?;
        print_json(&cleared)
      }
    },
    Commands::CopyWorkflow { from, to, title } => {
      if let Some(title) = title {
        let source = service
          .engine()
          .graph(WorkflowId(from))
          .await
          .context("failed to load source workflow")?;
        let header = Workflow {
          workflow_id: WorkflowId(to),
          title,
          initial_status: None,
          ..source.workflow().clone()
        };
        service
          .create_workflow(header, &cancel)
          .await
          .context("failed to create target workflow")?;
      }
      let copy = service
        .copy_workflow(WorkflowId(from), WorkflowId(to), &cancel)
        .await
        .context("failed to copy workflow")?;
      print_json(&copy)
    }
    Commands::CopyActions { src, dest } => {
      let copies = service
        .copy_actions(OptionId(src), OptionId(dest), &cancel)
        .await
        .context("failed to copy actions")?;
      print_json(&copies)
    }
    Commands::CopyRules { src, dest } => {
      let copies = service
        .copy_rules(OptionId(src), OptionId(dest), &cancel)
        .await
        .context("failed to copy rules")?;
      print_json(&copies)
    }
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn read_fields_from_stdin() -> Result<CaseFields> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    return Ok(CaseFields::new());
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read case fields from stdin")?;

  if input.trim().is_empty() {
    Ok(CaseFields::new())
  } else {
    serde_json::from_str(&input).context("failed to parse case fields JSON from stdin")
  }
}
