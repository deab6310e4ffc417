use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::errors::JobsError;

/// Name of a pipeline (a named, independently configured queue).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineName(String);

impl PipelineName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Names end up in queue/tube names on every backend, so keep them to a
    /// charset all of them accept.
    pub fn validate(&self) -> Result<(), JobsError> {
        let valid = !self.0.is_empty()
            && self.0.len() <= 64
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(())
        } else {
            Err(JobsError::Config(format!(
                "invalid pipeline name `{}`: use 1-64 chars of [A-Za-z0-9._-]",
                self.0
            )))
        }
    }
}

impl fmt::Display for PipelineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for PipelineName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PipelineName {
    fn from(s: String) -> Self {
        Self(s)
    }
}
