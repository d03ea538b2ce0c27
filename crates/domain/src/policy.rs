use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How upstream candidates are ordered for a single query.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamPolicy {
    #[default]
    Random,

    RoundRobin,

    Sequential,
}

impl UpstreamPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::RoundRobin => "round_robin",
            Self::Sequential => "sequential",
        }
    }
}

impl FromStr for UpstreamPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Self::Random),
            "round_robin" => Ok(Self::RoundRobin),
            "sequential" => Ok(Self::Sequential),
            other => Err(format!("unknown policy '{}'", other)),
        }
    }
}

impl fmt::Display for UpstreamPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
