//! ECT Workflow
//!
//! This crate provides the validated status graph for ECT workflows.
//! A [`StatusGraph`] is built from a `WorkflowDefinition` and is the only
//! form the engine evaluates cases against.
//!
//! Key differences from the raw definition in `ect-config`:
//! - Ids are unique and every record points at something that exists
//! - Option targets stay inside the workflow unless flagged cross-workflow
//! - Options, actions, rules and validations are indexed by their owner
//! - Options and actions come back already ordered by sort order

mod error;
mod graph;

pub use error::WorkflowError;
pub use graph::StatusGraph;
