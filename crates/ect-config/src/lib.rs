//! ECT Config
//!
//! This crate contains the serializable workflow definition types for the ECT
//! workflow engine. These types describe a workflow's statuses, options,
//! actions, rules and validations as an administrator configures them, before
//! they are validated into a `StatusGraph`.
//!
//! Definitions can be loaded from:
//! - JSON documents (via the CLI `import` command)
//! - The relational store (as rows)
//!
//! The crate also holds the [`EngineConfig`] file format.

mod definition;
mod engine;
mod enums;
mod ids;
mod workflow;

pub use definition::WorkflowDefinition;
pub use engine::{ConfigError, EngineConfig};
pub use enums::{Compo, UnknownCompo};
pub use ids::{
  ActionId, ModuleId, OptionId, RefId, ReturnId, RuleId, SignatureId, StatusId, TrackingId,
  UserId, ValidationId, WorkflowId,
};
pub use workflow::{
  Status, StatusAction, StatusOption, StatusRule, StatusValidation, Workflow,
};
