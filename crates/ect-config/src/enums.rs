use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Service component a workflow (or option) is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compo {
  Active,
  Reserve,
  Guard,
}

impl Compo {
  pub const ALL: [Compo; 3] = [Compo::Active, Compo::Reserve, Compo::Guard];

  pub fn as_str(&self) -> &'static str {
    match self {
      Compo::Active => "active",
      Compo::Reserve => "reserve",
      Compo::Guard => "guard",
    }
  }
}

impl fmt::Display for Compo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Error returned when parsing an unknown component name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown component: {0}")]
pub struct UnknownCompo(pub String);

impl FromStr for Compo {
  type Err = UnknownCompo;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "active" => Ok(Compo::Active),
      "reserve" => Ok(Compo::Reserve),
      "guard" => Ok(Compo::Guard),
      other => Err(UnknownCompo(other.to_string())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_compo_parse_roundtrip() {
    for compo in Compo::ALL {
      assert_eq!(compo.as_str().parse::<Compo>().unwrap(), compo);
    }
    assert_eq!("GUARD".parse::<Compo>().unwrap(), Compo::Guard);
    assert!("navy".parse::<Compo>().is_err());
  }
}
