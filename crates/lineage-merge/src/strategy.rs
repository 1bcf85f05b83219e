use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MergeError;

/// How a source line's state is folded into a target line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// The source state replaces the target state wholesale. Never conflicts.
    Overwrite,
    /// Field-level merge against the common ancestor.
    #[default]
    ThreeWay,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::ThreeWay => "three_way",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "three_way" | "three-way" | "threeway" => Ok(Self::ThreeWay),
            _ => Err(MergeError::UnknownStrategy(s.to_string())),
        }
    }
}
