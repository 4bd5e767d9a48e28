//! Opaque identifiers.
//!
//! Every record in the engine is addressed by an integer newtype so that a
//! status id can never be passed where an option id is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
  ($(#[$meta:meta])* $name:ident) => {
    $(#[$meta])*
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct $name(pub i64);

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
      }
    }

    impl From<i64> for $name {
      fn from(value: i64) -> Self {
        Self(value)
      }
    }
  };
}

id_type!(
  /// Identifies a workflow (one state machine).
  WorkflowId
);
id_type!(
  /// Identifies a status node.
  StatusId
);
id_type!(
  /// Identifies a status option (an edge).
  OptionId
);
id_type!(
  /// Identifies an action attached to an option.
  ActionId
);
id_type!(
  /// Identifies a rule attached to an option.
  RuleId
);
id_type!(
  /// Identifies a validation attached to a status.
  ValidationId
);
id_type!(
  /// Identifies a status tracking (audit) row.
  TrackingId
);
id_type!(
  /// Identifies a return / RWOA record.
  ReturnId
);
id_type!(
  /// Identifies a recorded signature.
  SignatureId
);
id_type!(
  /// Identifies a user.
  UserId
);
id_type!(
  /// The case reference a workflow instance is attached to (e.g. a LOD id).
  RefId
);
id_type!(
  /// The module (case type) a workflow belongs to: LOD, appeal, SARC, ...
  ModuleId
);
