//! ECT Service
//!
//! The call surface of the workflow engine: status and option lookups,
//! workstatus history, lock introspection, case operations and definition
//! administration. Every call takes a `CancellationToken` and returns a
//! [`ServiceError`] that keeps the error kind (and lock, rule or validation
//! detail) while hiding internal failures behind a correlation id.

mod error;
mod service;
mod views;

pub use error::{ErrorDetail, ServiceError};
pub use service::WorkflowService;
pub use views::{StepView, WorkstatusView};

pub use ect_engine::ErrorKind;
