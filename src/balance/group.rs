/// Order in which address groups are tried
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GroupBalanceStrategy {
    /// Groups in configured order, moving to the next one when a group is exhausted
    #[default]
    GroupRotation,
}

impl GroupBalanceStrategy {
    pub fn name(self) -> &'static str {
        match self {
            GroupBalanceStrategy::GroupRotation => "GroupRotation",
        }
    }

    /// Group indices in try order
    pub fn order(self, group_count: usize) -> impl Iterator<Item = usize> {
        match self {
            GroupBalanceStrategy::GroupRotation => 0..group_count,
        }
    }
}

impl fmt::Display for GroupBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for GroupBalanceStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GroupRotation" | "groupRotation" | "group_rotation" => {
                Ok(GroupBalanceStrategy::GroupRotation)
            }
            other => Err(ConfigError::ValidationError(format!(
                "unknown group balance strategy '{other}'"
            ))),
        }
    }
}
