pub mod performance;
pub mod safety;
pub mod schema_validator;
pub mod sql_text;

pub use performance::{PerformanceAdvisor, PerformanceThresholds};
pub use safety::SafetyValidator;
pub use schema_validator::SchemaValidator;

use crate::models::{SchemaSnapshot, ValidationLevel, ValidationVerdict};

/// Runs the validators a `ValidationLevel` asks for and folds their findings
/// into one verdict.
#[derive(Debug, Clone, Default)]
pub struct QueryValidator {
    advisor: PerformanceAdvisor,
}

impl QueryValidator {
    pub fn new(advisor: PerformanceAdvisor) -> Self {
        Self { advisor }
    }

    pub fn advisor(&self) -> &PerformanceAdvisor {
        &self.advisor
    }

    pub fn validate_query(
        &self,
        sql: &str,
        schema: Option<&SchemaSnapshot>,
        level: ValidationLevel,
    ) -> ValidationVerdict {
        let mut verdict = SafetyValidator::validate(sql);
        if !verdict.is_valid {
            tracing::warn!("Query rejected by safety validation: {}", verdict.errors.join("; "));
        }

        if level == ValidationLevel::Safety {
            return verdict;
        }

        if let Some(schema) = schema {
            verdict.merge(SchemaValidator::validate(sql, schema));
        }

        if level == ValidationLevel::Full {
            verdict.merge(self.advisor.analyze(sql));
        }

        verdict
    }
}
