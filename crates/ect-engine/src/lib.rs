//! ECT Workflow Engine
//!
//! This crate moves cases through the status graphs defined in `ect-config`
//! and validated by `ect-workflow`, persisting everything through an
//! `ect-store` backend.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! │  - start_case / transition / return_case                    │
//! │  - definition edits and copies (admin)                      │
//! │  - lock administration, history, signatures                 │
//! └─────────────────────────────────────────────────────────────┘
//!          │                 │                    │
//!          ▼                 ▼                    ▼
//! ┌─────────────────┐ ┌──────────────────┐ ┌─────────────────────┐
//! │   GraphCache    │ │    Evaluator     │ │    LockManager      │
//! │  StatusGraph    │ │  rules (AND/OR)  │ │  one lock per case  │
//! │  per workflow   │ │  validations     │ │  re-entrant per user│
//! └─────────────────┘ └──────────────────┘ └─────────────────────┘
//!          │                 │                    │
//!          ▼                 ▼                    ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        dyn Store                            │
//! │  - commit_transition: close + open + effects in one unit    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use ect_engine::{Actor, Engine, TransitionRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! let engine = Engine::new(store, &EngineConfig::default());
//!
//! let outcome = engine
//!     .transition(
//!         &TransitionRequest {
//!             ref_id: RefId(1042),
//!             module: ModuleId(2),
//!             option_id: OptionId(7),
//!             actor: Actor::new(UserId(5), "Smith").with_rank("Maj"),
//!         },
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! ```

mod actions;
mod admin;
mod audit;
mod cache;
mod context;
mod coordinator;
mod engine;
mod error;
mod events;
mod locks;
mod returns;
mod rules;

pub use actions::{
  ActionExecutor, ActionRegistry, AddSignature, ClearField, Effect, NotifyGroup, SetField,
  StagedEffects,
};
pub use admin::{NewAction, NewOption, NewRule, NewStatus, NewValidation};
pub use audit::AuditTracker;
pub use cache::GraphCache;
pub use context::{Actor, CaseContext};
pub use coordinator::{StartCaseRequest, StartOutcome, TransitionOutcome, TransitionRequest};
pub use engine::Engine;
pub use error::{EngineError, ErrorKind, FailedCheck};
pub use events::{ChannelNotifier, EngineEvent, EngineNotifier, NoopNotifier};
pub use locks::{LockInfo, LockManager, LockOutcome};
pub use returns::{ReturnOutcome, ReturnRequest, is_rerouting};
pub use rules::{
  EvaluationResult, Evaluator, FieldAbsent, FieldEquals, MemberOfGroup, Predicate,
  PredicateError, PredicateRegistry, RequireField, RequireSignature, Verdict,
};
