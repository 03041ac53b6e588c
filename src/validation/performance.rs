use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::safety::SafetyValidator;
use super::sql_text::{depth_at, in_query_scope, strip_comments, MaskedSql};
use crate::models::{DatabaseType, SchemaSnapshot, ValidationVerdict};

/// Limits above which the advisor starts warning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceThresholds {
    pub max_or_conditions: usize,
    pub max_joins: usize,
    pub max_group_by_columns: usize,
    /// Row cap applied by `optimize` when the query has none.
    pub default_row_cap: usize,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            max_or_conditions: 5,
            max_joins: 5,
            max_group_by_columns: 5,
            default_row_cap: 1000,
        }
    }
}

static SELECT_STAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bSELECT\s+(?:DISTINCT\s+)?(?:TOP\s*\(?\s*\d+\s*\)?\s+)?\*")
        .expect("select star pattern must compile")
});

static FROM_KEYWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bFROM\b").expect("from pattern must compile"));

static WHERE_KEYWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bWHERE\b").expect("where pattern must compile"));

static ROW_LIMIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bTOP\s*\(?\s*\d+|\bLIMIT\s+\d+|\bFETCH\s+(?:NEXT|FIRST)\b")
        .expect("row limit pattern must compile")
});

static OR_KEYWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bOR\b").expect("or pattern must compile"));

static JOIN_KEYWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bJOIN\b").expect("join pattern must compile"));

static GROUP_BY_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\bGROUP\s+BY\b(.*?)(?:\bHAVING\b|\bORDER\s+BY\b|\bLIMIT\b|\bOPTION\b|\)|$)")
        .expect("group by pattern must compile")
});

static LEADING_WILDCARD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bLIKE\s+N?'[%_]").expect("like pattern must compile")
});

static WHERE_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\bWHERE\b(.*?)(?:\bGROUP\s+BY\b|\bORDER\s+BY\b|\bHAVING\b|\bLIMIT\b|\bOPTION\b|$)")
        .expect("where pattern must compile")
});

static WRAPPED_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(UPPER|LOWER|LTRIM|RTRIM|TRIM|YEAR|MONTH|DAY|CAST|CONVERT|SUBSTRING|LEFT|RIGHT|DATEPART|ISNULL|IFNULL|COALESCE|LEN|LENGTH|TO_DATE|TO_VARCHAR)\s*\(\s*[A-Za-z_][^()]*\)\s*(?:=|<>|!=|<=|>=|<|>|\bLIKE\b|\bIN\b|\bBETWEEN\b)",
    )
    .expect("wrapped column pattern must compile")
});

static TABLE_SOURCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:FROM|JOIN)\s+((?:[\w\[\]"]+\.){0,2}[\w\[\]"]+)(?:\s+(?:AS\s+)?([A-Za-z_]\w*))?"#,
    )
    .expect("table source pattern must compile")
});

static TABLE_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(?:WITH\s*)?\(").expect("hint pattern must compile"));

static CTE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\bWITH|,)\s+([A-Za-z_]\w*)\s*(?:\([^)]*\))?\s+AS\s*\(")
        .expect("cte pattern must compile")
});

static SELECT_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bSELECT(?:\s+DISTINCT)?\b").expect("select head pattern must compile")
});

static EQUI_JOIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bON\s+([A-Za-z_]\w*)\.([A-Za-z_]\w*)\s*=\s*([A-Za-z_]\w*)\.([A-Za-z_]\w*)",
    )
    .expect("equi join pattern must compile")
});

// Words TABLE_SOURCE may pick up as an alias that are really the next clause.
const CLAUSE_WORDS: &[&str] = &[
    "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "ON", "GROUP", "ORDER",
    "HAVING", "UNION", "WITH", "OPTION", "LIMIT", "OFFSET", "FETCH", "PIVOT", "UNPIVOT", "APPLY",
];

struct TableSource {
    name: String,
    alias: Option<String>,
    /// Byte offset in masked text where a table hint would go.
    hint_at: usize,
    hinted: bool,
}

/// Heuristic performance warnings and best-effort rewrites.
#[derive(Debug, Clone, Default)]
pub struct PerformanceAdvisor {
    thresholds: PerformanceThresholds,
}

impl PerformanceAdvisor {
    pub fn new(thresholds: PerformanceThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &PerformanceThresholds {
        &self.thresholds
    }

    /// Advisory only; the verdict is always valid.
    pub fn analyze(&self, sql: &str) -> ValidationVerdict {
        let mut verdict = ValidationVerdict::valid();
        let stripped = strip_comments(sql);
        let masked = MaskedSql::new(&stripped);
        let text = masked.text.as_str();

        if SELECT_STAR.is_match(text) {
            verdict.add_warning("SELECT * retrieves every column; list only the columns you need");
        }

        let has_from = FROM_KEYWORD.is_match(text);
        if has_from && !WHERE_KEYWORD.is_match(text) {
            verdict.add_warning("Query has no WHERE clause and may scan the entire table");
        }
        if has_from && !ROW_LIMIT.is_match(text) {
            verdict.add_warning("Result set is unbounded; consider TOP n or LIMIT n");
        }

        let or_count = OR_KEYWORD.find_iter(text).count();
        if or_count > self.thresholds.max_or_conditions {
            verdict.add_warning(format!(
                "Query uses {} OR conditions; consider IN (...) or UNION of indexed lookups",
                or_count
            ));
        }

        let join_count = JOIN_KEYWORD.find_iter(text).count();
        if join_count > self.thresholds.max_joins {
            verdict.add_warning(format!(
                "Query joins {} tables; consider splitting it or pre-aggregating",
                join_count
            ));
        }

        for captures in GROUP_BY_LIST.captures_iter(text) {
            let columns = captures[1].split(',').filter(|c| !c.trim().is_empty()).count();
            if columns > self.thresholds.max_group_by_columns {
                verdict.add_warning(format!(
                    "GROUP BY has {} columns; large groupings are expensive",
                    columns
                ));
            }
        }

        if LEADING_WILDCARD.is_match(&stripped) {
            verdict.add_warning("LIKE pattern with a leading wildcard cannot use an index");
        }

        for clause in WHERE_CLAUSE.captures_iter(text) {
            for wrapped in WRAPPED_COLUMN.captures_iter(&clause[1]) {
                verdict.add_warning(format!(
                    "Function {} applied to a column in WHERE prevents index use",
                    wrapped[1].to_uppercase()
                ));
            }
        }

        verdict
    }

    /// Best-effort rewrite for `dialect`. Returns the SQL to run and a note per change.
    ///
    /// A rewrite that no longer passes the safety check is thrown away and the
    /// original text is returned unchanged.
    pub fn optimize(
        &self,
        sql: &str,
        dialect: DatabaseType,
        schema: Option<&SchemaSnapshot>,
    ) -> (String, Vec<String>) {
        let stripped = strip_comments(sql);
        let body = stripped
            .trim()
            .trim_end_matches(|c: char| c == ';' || c.is_whitespace());
        let masked = MaskedSql::new(body);
        let mut text = masked.text.clone();
        let mut notes = Vec::new();

        let sources = Self::table_sources(&text);

        if let Some(schema) = schema {
            Self::note_unkeyed_joins(&text, &sources, schema, &mut notes);
        }

        if dialect == DatabaseType::Mssql {
            for source in sources.iter().rev().filter(|s| !s.hinted) {
                text.insert_str(source.hint_at, " WITH (NOLOCK)");
                notes.push(format!("Added WITH (NOLOCK) read hint to {}", source.name));
            }
        }

        let cap = self.thresholds.default_row_cap;
        if cap > 0 && FROM_KEYWORD.is_match(&text) && !ROW_LIMIT.is_match(&text) {
            let capped = match dialect {
                DatabaseType::Mssql => SELECT_HEAD
                    .find_iter(&text)
                    .find(|m| depth_at(&text, m.start()) == 0)
                    .map(|m| {
                        let mut capped = text.clone();
                        capped.insert_str(m.end(), &format!(" TOP {}", cap));
                        capped
                    }),
                DatabaseType::Hana => Some(format!("{} LIMIT {}", text, cap)),
            };
            if let Some(capped) = capped {
                text = capped;
                notes.push(format!("Added row cap of {} rows", cap));
            }
        }

        if text == masked.text {
            return (sql.to_string(), notes);
        }

        let rewritten = masked.restore(&text);
        let verdict = SafetyValidator::validate(&rewritten);
        if !verdict.is_valid {
            tracing::warn!(
                "Discarding optimized query that failed safety validation: {}",
                verdict.errors.join("; ")
            );
            return (
                sql.to_string(),
                vec!["Optimization discarded: rewritten query failed safety validation".to_string()],
            );
        }

        tracing::debug!("Optimized query for {}: {}", dialect.as_str(), rewritten);
        (rewritten, notes)
    }

    fn table_sources(text: &str) -> Vec<TableSource> {
        let cte_names: HashSet<String> = CTE_NAME
            .captures_iter(text)
            .map(|c| c[1].to_lowercase())
            .collect();

        let mut sources = Vec::new();
        for captures in TABLE_SOURCE.captures_iter(text) {
            let Some(table) = captures.get(1) else {
                continue;
            };
            if !in_query_scope(text, table.start()) {
                continue;
            }
            let name = table.as_str().to_string();
            let bare = name
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .trim_matches(|c| c == '[' || c == ']' || c == '"')
                .to_lowercase();
            if cte_names.contains(&bare) || name.starts_with('#') {
                continue;
            }
            // table-valued functions take arguments
            if text[table.end()..].starts_with('(') {
                continue;
            }

            let alias = captures
                .get(2)
                .filter(|a| !CLAUSE_WORDS.iter().any(|w| w.eq_ignore_ascii_case(a.as_str())));
            let hint_at = alias.map_or(table.end(), |a| a.end());
            sources.push(TableSource {
                name,
                alias: alias.map(|a| a.as_str().to_string()),
                hint_at,
                hinted: TABLE_HINT.is_match(&text[hint_at..]),
            });
        }
        sources
    }

    fn note_unkeyed_joins(
        text: &str,
        sources: &[TableSource],
        schema: &SchemaSnapshot,
        notes: &mut Vec<String>,
    ) {
        let mut scope = HashMap::new();
        for source in sources {
            let bare = source
                .name
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .trim_matches(|c| c == '[' || c == ']' || c == '"');
            if let Some(table) = schema.find_table(None, bare) {
                scope.insert(bare.to_lowercase(), table);
                if let Some(alias) = &source.alias {
                    scope.insert(alias.to_lowercase(), table);
                }
            }
        }

        for captures in EQUI_JOIN.captures_iter(text) {
            for (qualifier, column) in [(&captures[1], &captures[2]), (&captures[3], &captures[4])] {
                let Some(table) = scope.get(&qualifier.to_lowercase()) else {
                    continue;
                };
                if table.column(column).is_some() && !table.is_key_column(column) {
                    let note = format!(
                        "Join column {}.{} is not a key column; an index on it may help",
                        table.name, column
                    );
                    if !notes.contains(&note) {
                        notes.push(note);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Column, Table};

    fn advisor() -> PerformanceAdvisor {
        PerformanceAdvisor::default()
    }

    fn has_warning(verdict: &ValidationVerdict, needle: &str) -> bool {
        verdict.warnings.iter().any(|w| w.contains(needle))
    }

    #[test]
    fn test_select_star_without_where() {
        let verdict = advisor().analyze("SELECT * FROM orders");
        assert!(verdict.is_valid);
        assert!(has_warning(&verdict, "SELECT *"));
        assert!(has_warning(&verdict, "no WHERE clause"));
        assert!(has_warning(&verdict, "unbounded"));
    }

    #[test]
    fn test_clean_query_has_no_warnings() {
        let verdict = advisor().analyze("SELECT TOP 10 id, name FROM orders WHERE id = 1");
        assert!(verdict.warnings.is_empty(), "{:?}", verdict.warnings);
    }

    #[test]
    fn test_threshold_warnings() {
        let ors = "SELECT id FROM t WHERE a = 1 OR a = 2 OR a = 3 OR a = 4 OR a = 5 OR a = 6 OR a = 7 LIMIT 5";
        assert!(has_warning(&advisor().analyze(ors), "6 OR conditions"));

        let joins = "SELECT a.id FROM a JOIN b ON a.id = b.id JOIN c ON a.id = c.id JOIN d ON a.id = d.id \
                     JOIN e ON a.id = e.id JOIN f ON a.id = f.id JOIN g ON a.id = g.id WHERE a.id = 1 LIMIT 1";
        assert!(has_warning(&advisor().analyze(joins), "joins 6 tables"));

        let groups = "SELECT a, b, c, d, e, f, COUNT(*) FROM t WHERE a > 0 GROUP BY a, b, c, d, e, f LIMIT 9";
        assert!(has_warning(&advisor().analyze(groups), "GROUP BY has 6 columns"));
    }

    #[test]
    fn test_index_defeating_predicates() {
        let verdict = advisor()
            .analyze("SELECT id FROM customers WHERE UPPER(name) = 'BOB' AND email LIKE '%@corp.com' LIMIT 5");
        assert!(has_warning(&verdict, "leading wildcard"));
        assert!(has_warning(&verdict, "Function UPPER"));
    }

    #[test]
    fn test_optimize_mssql_adds_hints_and_cap() {
        let (sql, notes) = advisor().optimize(
            "SELECT o.id FROM orders o JOIN customers c ON o.customer_id = c.id WHERE c.name = 'x'",
            DatabaseType::Mssql,
            None,
        );
        assert_eq!(
            sql,
            "SELECT TOP 1000 o.id FROM orders o WITH (NOLOCK) JOIN customers c WITH (NOLOCK) ON o.customer_id = c.id WHERE c.name = 'x'"
        );
        assert_eq!(notes.len(), 3);
    }

    #[test]
    fn test_optimize_skips_from_inside_function_call() {
        let (sql, _) = advisor().optimize(
            "SELECT TRIM('x' FROM name), EXTRACT(YEAR FROM created) FROM customers WHERE id = 1",
            DatabaseType::Mssql,
            None,
        );
        assert_eq!(
            sql,
            "SELECT TOP 1000 TRIM('x' FROM name), EXTRACT(YEAR FROM created) FROM customers WITH (NOLOCK) WHERE id = 1"
        );
    }

    #[test]
    fn test_optimize_keeps_existing_hint_and_limit() {
        let sql = "SELECT TOP 5 id FROM orders WITH (NOLOCK) WHERE id > 1";
        let (out, notes) = advisor().optimize(sql, DatabaseType::Mssql, None);
        assert_eq!(out, sql);
        assert!(notes.is_empty());
    }

    #[test]
    fn test_optimize_hana_appends_limit() {
        let (sql, notes) = advisor().optimize("SELECT id FROM orders WHERE id > 1;", DatabaseType::Hana, None);
        assert_eq!(sql, "SELECT id FROM orders WHERE id > 1 LIMIT 1000");
        assert_eq!(notes, vec!["Added row cap of 1000 rows".to_string()]);
    }

    #[test]
    fn test_unsafe_rewrite_is_discarded() {
        let sql = "DELETE FROM orders WHERE id = 1";
        let (out, notes) = advisor().optimize(sql, DatabaseType::Mssql, None);
        assert_eq!(out, sql);
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("discarded"));
    }

    #[test]
    fn test_optimize_notes_non_key_join_columns() {
        let mut orders = Table::new(
            "orders",
            vec![Column::new("id", "INT"), Column::new("customer_ref", "INT")],
        );
        orders.primary_key = vec!["id".to_string()];
        let mut customers = Table::new("customers", vec![Column::new("id", "INT")]);
        customers.primary_key = vec!["id".to_string()];
        let schema = SchemaSnapshot::single("dbo", vec![orders, customers]);

        let (_, notes) = advisor().optimize(
            "SELECT o.id FROM orders o JOIN customers c ON o.customer_ref = c.id LIMIT 5",
            DatabaseType::Hana,
            Some(&schema),
        );
        assert!(notes.iter().any(|n| n.contains("orders.customer_ref")));
        assert!(!notes.iter().any(|n| n.contains("customers.id")));
    }
}
