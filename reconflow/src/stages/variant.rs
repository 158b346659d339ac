//! Parameter variants for stage actions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One named parameter set for a stage action.
///
/// Parameters are kept sorted by key so that rendered command lines are
/// stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterVariant {
    /// Label used in logs and reports (e.g. "gpu", "cpu").
    pub label: String,
    /// Key/value parameters.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl ParameterVariant {
    /// Creates an empty variant.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            params: BTreeMap::new(),
        }
    }

    /// Sets a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    /// Returns a parameter value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parses a parameter value.
    #[must_use]
    pub fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }
}

impl Default for ParameterVariant {
    fn default() -> Self {
        Self::new("default")
    }
}

impl fmt::Display for ParameterVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)?;
        if !self.params.is_empty() {
            let rendered: Vec<String> = self.params.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, " ({})", rendered.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_are_sorted() {
        let v = ParameterVariant::new("gpu")
            .with_param("PatchMatchStereo.max_image_size", 2400)
            .with_param("PatchMatchStereo.gpu_index", 0);

        let keys: Vec<&String> = v.params.keys().collect();
        assert_eq!(
            keys,
            vec!["PatchMatchStereo.gpu_index", "PatchMatchStereo.max_image_size"]
        );
        assert_eq!(v.parse::<u32>("PatchMatchStereo.max_image_size"), Some(2400));
        assert_eq!(v.parse::<u32>("missing"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(ParameterVariant::default().to_string(), "default");
        assert_eq!(
            ParameterVariant::new("cpu").with_param("depth", 13).to_string(),
            "cpu (depth=13)"
        );
    }
}
