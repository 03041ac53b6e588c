use once_cell::sync::Lazy;
use regex::Regex;

use super::sql_text::{first_keyword, strip_comments, MaskedSql};
use crate::error::{CoreError, CoreResult};
use crate::models::ValidationVerdict;

struct SafetyRule {
    pattern: Regex,
    reason: &'static str,
}

fn rule(pattern: &str, reason: &'static str) -> SafetyRule {
    SafetyRule {
        pattern: Regex::new(pattern).expect("safety pattern must compile"),
        reason,
    }
}

/// Patterns matched against comment-free text with string literals masked out.
static RULES: Lazy<Vec<SafetyRule>> = Lazy::new(|| {
    vec![
        rule(
            r"(?i)\bUNION\b(\s+ALL)?\s+SELECT\b",
            "UNION-based query combination is not allowed",
        ),
        rule(
            r"(?i);\s*(SELECT|INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|TRUNCATE|EXEC|EXECUTE|DECLARE|SHUTDOWN|GRANT)\b",
            "Stacked command after semicolon",
        ),
        rule(
            r"(?i)\b(xp|sp)_\w+",
            "System or extended stored procedure call",
        ),
        rule(r"(?i)\bEXEC(UTE)?\b", "Dynamic execution (EXEC) is not allowed"),
        rule(
            r"(?i)\bWAITFOR\s+(DELAY|TIME)\b",
            "Time-based attack pattern (WAITFOR)",
        ),
        rule(
            r"(?i)\b(SLEEP|PG_SLEEP|BENCHMARK)\s*\(",
            "Time-based attack pattern (SLEEP/BENCHMARK)",
        ),
        rule(
            r"(?i)\b(OPENROWSET|OPENDATASOURCE|OPENQUERY|LOAD_FILE)\b",
            "File-system or external data source access",
        ),
        rule(
            r"(?i)\bBULK\s+INSERT\b",
            "File-system or external data source access",
        ),
        rule(
            r"(?i)\bINTO\s+(OUT|DUMP)FILE\b",
            "File-system or external data source access",
        ),
        rule(r"(?i)\bOR\s+TRUE\b", "Always-true condition"),
        rule(r"(?i)\b0x[0-9a-f]{8,}\b", "Suspicious hexadecimal literal"),
        rule(
            r"(?i)\bSELECT\b[^;]*?\bINTO\b",
            "SELECT ... INTO creates database objects",
        ),
    ]
});

static FORBIDDEN_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|MERGE|DROP|ALTER|CREATE|TRUNCATE|GRANT|REVOKE|DENY|SHUTDOWN|BACKUP|RESTORE|DBCC|RECONFIGURE)\b",
    )
    .expect("keyword pattern must compile")
});

// Matched on unmasked text: the operands are usually literals.
static TAUTOLOGY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bOR\s+('[^']*'|\d+)\s*=\s*('[^']*'|\d+)")
        .expect("tautology pattern must compile")
});

static KEYWORD_IN_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(SELECT|INSERT|UPDATE|DELETE|DROP|UNION|EXEC|EXECUTE|ALTER|TRUNCATE|CREATE)\b\s+\S",
    )
    .expect("literal keyword pattern must compile")
});

/// Fatal read-only and injection checks.
///
/// Every rule runs; the verdict lists each distinct reason that matched.
pub struct SafetyValidator;

impl SafetyValidator {
    pub fn validate(sql: &str) -> ValidationVerdict {
        let mut verdict = ValidationVerdict::valid();

        let stripped = strip_comments(sql);
        let trimmed = stripped.trim();
        if trimmed.is_empty() {
            verdict.add_error("Empty SQL query");
            return verdict;
        }

        let masked = MaskedSql::new(trimmed);

        match first_keyword(&masked.text).as_deref() {
            Some("SELECT") | Some("WITH") => {}
            Some(other) => verdict.add_error(format!(
                "Only SELECT statements are allowed, found {}",
                other
            )),
            None => verdict.add_error("Query does not start with a SQL keyword"),
        }

        let body = masked
            .text
            .trim_end_matches(|c: char| c == ';' || c.is_whitespace());
        if body.contains(';') {
            verdict.add_error("Query contains multiple statements");
        }

        for captures in FORBIDDEN_KEYWORD.captures_iter(&masked.text) {
            verdict.add_error(format!(
                "{} is not allowed in a read-only query",
                captures[1].to_uppercase()
            ));
        }

        for rule in RULES.iter() {
            if rule.pattern.is_match(&masked.text) {
                verdict.add_error(rule.reason);
            }
        }

        for captures in TAUTOLOGY.captures_iter(trimmed) {
            if captures[1] == captures[2] {
                verdict.add_error("Always-true condition");
            }
        }

        if masked
            .literal_bodies()
            .any(|body| KEYWORD_IN_LITERAL.is_match(body))
        {
            verdict.add_error("SQL keyword embedded in string literal");
        }

        verdict
    }

    /// `validate` folded into a `Result` for the execution gate.
    pub fn check(sql: &str) -> CoreResult<()> {
        let verdict = Self::validate(sql);
        if verdict.is_valid {
            Ok(())
        } else {
            Err(CoreError::InvalidQuery {
                reasons: verdict.errors,
            })
        }
    }
}
