// Dialect rule table
//
// Ordered, declarative table of SQL features with one optional form per
// dialect. Translation walks the table in order and rewrites raw SQL text;
// it is only correct for the features listed here.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::error::{CoreError, CoreResult};
use crate::models::DatabaseType;
use crate::validation::sql_text::{depth_at, enclosing_group_end, enclosing_group_start, MaskedSql};

/// How a feature is carried across dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteKind {
    /// Source pattern replaced by the target template.
    Substitute,
    /// Same syntax on both sides; detected but never rewritten.
    PassThrough,
    /// `TOP n` <-> trailing `LIMIT n`.
    TopLimit,
    /// `OFFSET m ROWS FETCH NEXT n ROWS ONLY` <-> `LIMIT n OFFSET m`.
    OffsetFetch,
}

/// How one dialect spells a feature.
///
/// `pattern` recognises the feature in that dialect's SQL; `template` is what
/// the feature becomes when translating *into* that dialect. A form without a
/// pattern can be produced but never needs to be recognised (e.g. hint removal).
pub struct DialectForm {
    pub pattern: Option<Regex>,
    pub template: &'static str,
}

pub struct DialectFeature {
    pub name: &'static str,
    pub kind: RewriteKind,
    mssql: Option<DialectForm>,
    hana: Option<DialectForm>,
}

impl DialectFeature {
    pub fn form(&self, dialect: DatabaseType) -> Option<&DialectForm> {
        match dialect {
            DatabaseType::Mssql => self.mssql.as_ref(),
            DatabaseType::Hana => self.hana.as_ref(),
        }
    }

    fn matches(&self, dialect: DatabaseType, text: &str) -> bool {
        self.form(dialect)
            .and_then(|f| f.pattern.as_ref())
            .map_or(false, |p| p.is_match(text))
    }
}

fn form(pattern: &str, template: &'static str) -> Option<DialectForm> {
    Some(DialectForm {
        pattern: Some(Regex::new(pattern).expect("dialect pattern must compile")),
        template,
    })
}

fn output_only(template: &'static str) -> Option<DialectForm> {
    Some(DialectForm {
        pattern: None,
        template,
    })
}

fn feature(
    name: &'static str,
    kind: RewriteKind,
    mssql: Option<DialectForm>,
    hana: Option<DialectForm>,
) -> DialectFeature {
    DialectFeature {
        name,
        kind,
        mssql,
        hana,
    }
}

// An argument: a plain expression optionally ending in one call, e.g. GETDATE().
const ARG: &str = r"[^,()]+?(?:\([^()]*\))?";

fn standard_features() -> Vec<DialectFeature> {
    use RewriteKind::*;

    vec![
        feature(
            "nolock_hint",
            Substitute,
            form(r"(?i)\s*(?:WITH\s*)?\(\s*NOLOCK\s*\)", " WITH (NOLOCK)"),
            output_only(""),
        ),
        feature(
            "query_hint",
            Substitute,
            form(r"(?i)\s*\bOPTION\s*\((?:[^()]|\([^()]*\))*\)", ""),
            form(r"(?i)\s*\bWITH\s+HINT\s*\((?:[^()]|\([^()]*\))*\)", ""),
        ),
        feature(
            "cte",
            PassThrough,
            form(r#"(?i)^\s*WITH\s+[\w\[\]"]+\s*(?:\([^)]*\))?\s*AS\s*\("#, ""),
            form(r#"(?i)^\s*WITH\s+[\w\[\]"]+\s*(?:\([^)]*\))?\s*AS\s*\("#, ""),
        ),
        feature(
            "offset_fetch",
            OffsetFetch,
            form(
                r"(?i)\bOFFSET\s+(?P<offset>\d+)\s+ROWS?\s+FETCH\s+(?:NEXT|FIRST)\s+(?P<n>\d+)\s+ROWS?\s+ONLY\b",
                "OFFSET ${offset} ROWS FETCH NEXT ${n} ROWS ONLY",
            ),
            form(
                r"(?i)\bLIMIT\s+(?P<n>\d+)\s+OFFSET\s+(?P<offset>\d+)\b",
                "LIMIT ${n} OFFSET ${offset}",
            ),
        ),
        feature(
            "top_n",
            TopLimit,
            form(
                r"(?i)\bSELECT(?P<distinct>\s+DISTINCT)?\s+TOP\s*(?:\(\s*(?P<pn>\d+)\s*\)|(?P<n>\d+))",
                "TOP ${n}",
            ),
            form(
                r"(?i)\s*\bLIMIT\s+(?P<n>\d+)(?P<offset>\s+OFFSET\s+\d+)?",
                "LIMIT ${n}",
            ),
        ),
        feature(
            "add_days",
            Substitute,
            form(
                &format!(r"(?i)\bDATEADD\s*\(\s*(?:DAY|DD|D)\s*,\s*(?P<n>[^,()]+?)\s*,\s*(?P<expr>{ARG})\s*\)"),
                "DATEADD(DAY, ${n}, ${expr})",
            ),
            form(
                &format!(r"(?i)\bADD_DAYS\s*\(\s*(?P<expr>{ARG})\s*,\s*(?P<n>[^,()]+?)\s*\)"),
                "ADD_DAYS(${expr}, ${n})",
            ),
        ),
        feature(
            "add_months",
            Substitute,
            form(
                &format!(r"(?i)\bDATEADD\s*\(\s*(?:MONTH|MM|M)\s*,\s*(?P<n>[^,()]+?)\s*,\s*(?P<expr>{ARG})\s*\)"),
                "DATEADD(MONTH, ${n}, ${expr})",
            ),
            form(
                &format!(r"(?i)\bADD_MONTHS\s*\(\s*(?P<expr>{ARG})\s*,\s*(?P<n>[^,()]+?)\s*\)"),
                "ADD_MONTHS(${expr}, ${n})",
            ),
        ),
        feature(
            "add_years",
            Substitute,
            form(
                &format!(r"(?i)\bDATEADD\s*\(\s*(?:YEAR|YYYY|YY)\s*,\s*(?P<n>[^,()]+?)\s*,\s*(?P<expr>{ARG})\s*\)"),
                "DATEADD(YEAR, ${n}, ${expr})",
            ),
            form(
                &format!(r"(?i)\bADD_YEARS\s*\(\s*(?P<expr>{ARG})\s*,\s*(?P<n>[^,()]+?)\s*\)"),
                "ADD_YEARS(${expr}, ${n})",
            ),
        ),
        feature(
            "days_between",
            Substitute,
            form(
                &format!(r"(?i)\bDATEDIFF\s*\(\s*(?:DAY|DD|D)\s*,\s*(?P<a>{ARG})\s*,\s*(?P<b>{ARG})\s*\)"),
                "DATEDIFF(DAY, ${a}, ${b})",
            ),
            form(
                &format!(r"(?i)\bDAYS_BETWEEN\s*\(\s*(?P<a>{ARG})\s*,\s*(?P<b>{ARG})\s*\)"),
                "DAYS_BETWEEN(${a}, ${b})",
            ),
        ),
        feature(
            "datepart_year",
            Substitute,
            form(
                &format!(r"(?i)\bDATEPART\s*\(\s*(?:YEAR|YYYY|YY)\s*,\s*(?P<expr>{ARG})\s*\)"),
                "YEAR(${expr})",
            ),
            output_only("YEAR(${expr})"),
        ),
        feature(
            "datepart_month",
            Substitute,
            form(
                &format!(r"(?i)\bDATEPART\s*\(\s*(?:MONTH|MM|M)\s*,\s*(?P<expr>{ARG})\s*\)"),
                "MONTH(${expr})",
            ),
            output_only("MONTH(${expr})"),
        ),
        feature(
            "current_date",
            Substitute,
            form(
                r"(?i)\bCAST\s*\(\s*(?:GETDATE|SYSDATETIME)\s*\(\s*\)\s+AS\s+DATE\s*\)",
                "CAST(GETDATE() AS DATE)",
            ),
            form(r"(?i)\bCURRENT_DATE\b", "CURRENT_DATE"),
        ),
        feature(
            "current_timestamp",
            Substitute,
            form(r"(?i)\b(?:GETDATE|SYSDATETIME)\s*\(\s*\)", "GETDATE()"),
            form(r"(?i)\bCURRENT_TIMESTAMP\b", "CURRENT_TIMESTAMP"),
        ),
        feature(
            "string_length",
            Substitute,
            form(r"(?i)\bLEN\s*\(", "LEN("),
            form(r"(?i)\bLENGTH\s*\(", "LENGTH("),
        ),
        feature(
            "null_replacement",
            Substitute,
            form(r"(?i)\bISNULL\s*\(", "ISNULL("),
            form(r"(?i)\bIFNULL\s*\(", "IFNULL("),
        ),
        feature(
            "string_position",
            Substitute,
            form(
                &format!(r"(?i)\bCHARINDEX\s*\(\s*(?P<needle>[^,()]+?)\s*,\s*(?P<haystack>{ARG})\s*\)"),
                "CHARINDEX(${needle}, ${haystack})",
            ),
            form(
                &format!(r"(?i)\bLOCATE\s*\(\s*(?P<haystack>{ARG})\s*,\s*(?P<needle>[^,()]+?)\s*\)"),
                "LOCATE(${haystack}, ${needle})",
            ),
        ),
        feature(
            "uuid",
            Substitute,
            form(r"(?i)\bNEWID\s*\(\s*\)", "NEWID()"),
            form(r"(?i)\bSYSUUID\b", "SYSUUID"),
        ),
        feature(
            "sequence_next_value",
            Substitute,
            form(
                r#"(?i)\bNEXT\s+VALUE\s+FOR\s+(?P<seq>[\w\[\]"][\w.\[\]"]*)"#,
                "NEXT VALUE FOR ${seq}",
            ),
            form(
                r#"(?i)(?P<seq>[\w"][\w."]*)\.NEXTVAL\b"#,
                "${seq}.NEXTVAL",
            ),
        ),
        feature(
            "identifier_quoting",
            Substitute,
            form(r"\[(?P<ident>[^\[\]]+)\]", "[${ident}]"),
            form(r#""(?P<ident>[^"]+)""#, "\"${ident}\""),
        ),
        feature("pivot", Substitute, form(r"(?i)\bPIVOT\s*\(", "PIVOT("), None),
        feature("unpivot", Substitute, form(r"(?i)\bUNPIVOT\s*\(", "UNPIVOT("), None),
        feature(
            "apply_join",
            Substitute,
            form(r"(?i)\b(?:CROSS|OUTER)\s+APPLY\b", "CROSS APPLY"),
            None,
        ),
        feature(
            "series_generate",
            Substitute,
            None,
            form(r"(?i)\bSERIES_GENERATE_\w+\s*\(", "SERIES_GENERATE_INTEGER("),
        ),
    ]
}

static SELECT_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bSELECT(?:\s+DISTINCT)?\b").expect("select pattern must compile")
});

static ORDER_BY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bORDER\s+BY\b").expect("order by pattern must compile"));

/// Read-only table of dialect features, compiled once at startup.
pub struct DialectRuleSet {
    features: Vec<DialectFeature>,
}

impl DialectRuleSet {
    pub fn new() -> Self {
        Self {
            features: standard_features(),
        }
    }

    pub fn features(&self) -> &[DialectFeature] {
        &self.features
    }

    /// Rewrite `sql` from `source` to `target`.
    ///
    /// Refuses with `UntranslatableFeature` when the source uses a feature the
    /// target has no form for; nothing is rewritten in that case.
    pub fn translate(
        &self,
        sql: &str,
        source: DatabaseType,
        target: DatabaseType,
    ) -> CoreResult<String> {
        if source == target {
            return Ok(sql.to_string());
        }

        let masked = MaskedSql::new(sql);

        for feature in &self.features {
            if feature.matches(source, &masked.text) && feature.form(target).is_none() {
                return Err(CoreError::UntranslatableFeature {
                    feature: feature.name.to_string(),
                    target: target.display_name().to_string(),
                });
            }
        }

        let mut text = masked.text.clone();
        for feature in &self.features {
            let (Some(from), Some(to)) = (feature.form(source), feature.form(target)) else {
                continue;
            };
            let Some(pattern) = &from.pattern else {
                continue;
            };
            text = match feature.kind {
                RewriteKind::PassThrough => text,
                RewriteKind::Substitute => pattern.replace_all(&text, to.template).into_owned(),
                RewriteKind::OffsetFetch => Self::rewrite_offset_fetch(&text, pattern, to, target),
                RewriteKind::TopLimit => match target {
                    DatabaseType::Hana => Self::top_to_limit(&text, pattern),
                    DatabaseType::Mssql => Self::limit_to_top(&text, pattern),
                },
            };
        }

        let translated = masked.restore(&text);
        tracing::debug!(
            "Translated {} -> {}: {} => {}",
            source.as_str(),
            target.as_str(),
            sql,
            translated
        );
        Ok(translated)
    }

    /// Features recognised in `sql`, per dialect.
    pub fn detect_features(&self, sql: &str) -> HashMap<DatabaseType, Vec<&'static str>> {
        let masked = MaskedSql::new(sql);
        DatabaseType::ALL
            .iter()
            .map(|dialect| {
                let names = self
                    .features
                    .iter()
                    .filter(|f| f.matches(*dialect, &masked.text))
                    .map(|f| f.name)
                    .collect();
                (*dialect, names)
            })
            .collect()
    }

    /// Whether `sql` can be expressed in `target`. On failure the reason is the
    /// name of the first feature the target has no form for.
    pub fn is_compatible(&self, sql: &str, target: DatabaseType) -> (bool, Option<String>) {
        let masked = MaskedSql::new(sql);
        for feature in &self.features {
            if feature.form(target).is_some() {
                continue;
            }
            let used_elsewhere = DatabaseType::ALL
                .iter()
                .filter(|d| **d != target)
                .any(|d| feature.matches(*d, &masked.text));
            if used_elsewhere {
                return (false, Some(feature.name.to_string()));
            }
        }
        (true, None)
    }

    fn top_to_limit(text: &str, pattern: &Regex) -> String {
        let matches: Vec<(usize, usize, String, String)> = pattern
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let n = caps.name("n").or_else(|| caps.name("pn"))?.as_str().to_string();
                let distinct = caps.name("distinct").map_or("", |m| m.as_str()).to_string();
                Some((whole.start(), whole.end(), n, distinct))
            })
            .collect();

        let mut out = text.to_string();
        // last first, so earlier offsets stay valid
        for (start, end, n, distinct) in matches.into_iter().rev() {
            out.replace_range(start..end, &format!("SELECT{}", distinct));
            let group_end = enclosing_group_end(&out, start);
            let head = out[..group_end].trim_end().to_string();
            let tail = out[group_end..].to_string();
            out = format!("{} LIMIT {}{}", head, n, tail);
        }
        out
    }

    fn limit_to_top(text: &str, pattern: &Regex) -> String {
        let matches: Vec<(usize, usize, String)> = pattern
            .captures_iter(text)
            .filter(|caps| caps.name("offset").is_none())
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                Some((whole.start(), whole.end(), caps.name("n")?.as_str().to_string()))
            })
            .collect();

        let mut out = text.to_string();
        for (start, end, n) in matches.into_iter().rev() {
            let depth = depth_at(&out, start);
            let group_start = enclosing_group_start(&out, start);
            let select = SELECT_KEYWORD
                .find_iter(&out[group_start..start])
                .map(|m| (group_start + m.start(), group_start + m.end()))
                .find(|(s, _)| depth_at(&out, *s) == depth);
            let Some((_, select_end)) = select else {
                continue;
            };
            out.replace_range(start..end, "");
            out.insert_str(select_end, &format!(" TOP {}", n));
        }
        out
    }

    fn rewrite_offset_fetch(
        text: &str,
        pattern: &Regex,
        to: &DialectForm,
        target: DatabaseType,
    ) -> String {
        if target != DatabaseType::Mssql {
            return pattern.replace_all(text, to.template).into_owned();
        }

        let matches: Vec<(usize, usize, String)> = pattern
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let mut rendered = String::new();
                caps.expand(to.template, &mut rendered);
                Some((whole.start(), whole.end(), rendered))
            })
            .collect();

        let mut out = text.to_string();
        for (start, end, rendered) in matches.into_iter().rev() {
            let depth = depth_at(&out, start);
            let group_start = enclosing_group_start(&out, start);
            let ordered = ORDER_BY
                .find_iter(&out[group_start..start])
                .any(|m| depth_at(&out, group_start + m.start()) == depth);
            // T-SQL only accepts OFFSET/FETCH after an ORDER BY
            let replacement = if ordered {
                rendered
            } else {
                format!("ORDER BY (SELECT NULL) {}", rendered)
            };
            out.replace_range(start..end, &replacement);
        }
        out
    }
}

impl Default for DialectRuleSet {
    fn default() -> Self {
        Self::new()
    }
}
