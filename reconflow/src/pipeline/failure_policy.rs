//! Run-level failure policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What the executor does after a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop the run; every remaining stage is blocked (default).
    #[default]
    Stop,
    /// Keep running stages whose transitive dependencies are all satisfied.
    ContinueIndependent,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::ContinueIndependent => write!(f, "continue-independent"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(Self::Stop),
            "continue-independent" | "continue_independent" => Ok(Self::ContinueIndependent),
            other => Err(format!(
                "unknown failure policy '{other}' (expected 'stop' or 'continue-independent')"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        assert_eq!("stop".parse::<FailurePolicy>().unwrap(), FailurePolicy::Stop);
        assert_eq!(
            "continue-independent".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::ContinueIndependent
        );
        assert!("keep-going".parse::<FailurePolicy>().is_err());
        assert_eq!(FailurePolicy::ContinueIndependent.to_string(), "continue-independent");
        assert_eq!(FailurePolicy::default(), FailurePolicy::Stop);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&FailurePolicy::ContinueIndependent).unwrap();
        assert_eq!(json, "\"continue-independent\"");
        let back: FailurePolicy = serde_json::from_str("\"stop\"").unwrap();
        assert_eq!(back, FailurePolicy::Stop);
    }
}
