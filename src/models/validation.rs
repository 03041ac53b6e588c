use serde::{Deserialize, Serialize};

/// How much of the validation pipeline to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    /// Read-only and injection checks only.
    Safety,
    /// Safety plus schema cross-check.
    Schema,
    /// Safety, schema and performance heuristics.
    #[default]
    Full,
}

/// Produced fresh for every query; never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationVerdict {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Record a fatal reason; duplicates are dropped.
    pub fn add_error(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.errors.contains(&reason) {
            self.errors.push(reason);
        }
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }

    pub fn merge(&mut self, other: ValidationVerdict) {
        for error in other.errors {
            self.add_error(error);
        }
        for warning in other.warnings {
            self.add_warning(warning);
        }
    }
}
