use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

use super::sql_text::{in_query_scope, strip_comments, MaskedSql};
use crate::error::CoreError;
use crate::models::{SchemaSnapshot, Table, TypeFamily, ValidationVerdict};

static TABLE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r##"(?i)\b(?:FROM|JOIN)\s+((?:[\w\[\]"#]+\.){0,2}[\w\[\]"#]+)(?:\s+(?:AS\s+)?([A-Za-z_]\w*))?"##,
    )
    .expect("table pattern must compile")
});

static CTE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\bWITH|,)\s+([A-Za-z_]\w*)\s*(?:\([^)]*\))?\s+AS\s*\(")
        .expect("cte pattern must compile")
});

static QUALIFIED_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Za-z_]\w*)\.([A-Za-z_]\w*)\b").expect("column pattern must compile")
});

static SELECT_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\bSELECT\s+(?:DISTINCT\s+)?(?:TOP\s*\(?\s*\d+\s*\)?\s+)?(.*?)\bFROM\b")
        .expect("select list pattern must compile")
});

static WHERE_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\bWHERE\b(.*?)(?:\bGROUP\s+BY\b|\bORDER\s+BY\b|\bHAVING\b|\bUNION\b|\)|$)")
        .expect("where pattern must compile")
});

static PREDICATE_OPERAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b([A-Za-z_]\w*(?:\.[A-Za-z_]\w*)?)\s*(?:=|<>|!=|<=|>=|<|>|\bLIKE\b|\bIN\b|\bIS\b|\bBETWEEN\b|\bNOT\s+(?:LIKE|IN|BETWEEN)\b)",
    )
    .expect("predicate pattern must compile")
});

static COLUMN_ALIAS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bAS\s+\[?([A-Za-z_]\w*)\]?").expect("alias pattern must compile")
});

static JOIN_CONDITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:ON|AND)\s+([A-Za-z_]\w*)\.([A-Za-z_]\w*)\s*=\s*([A-Za-z_]\w*)\.([A-Za-z_]\w*)",
    )
    .expect("join pattern must compile")
});

static BARE_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^[\["]?([A-Za-z_]\w*)[\]"]?(?:\s+(?:AS\s+)?[\["]?[A-Za-z_]\w*[\]"]?)?$"#)
        .expect("select item pattern must compile")
});

const RESERVED: &[&str] = &[
    "AND", "OR", "NOT", "NULL", "IS", "IN", "LIKE", "BETWEEN", "EXISTS", "CASE", "WHEN", "THEN",
    "ELSE", "END", "AS", "ON", "WHERE", "SELECT", "FROM", "JOIN", "INNER", "LEFT", "RIGHT",
    "FULL", "OUTER", "CROSS", "GROUP", "ORDER", "BY", "HAVING", "UNION", "ALL", "DISTINCT",
    "TOP", "LIMIT", "OFFSET", "FETCH", "NEXT", "ROWS", "ONLY", "WITH", "NOLOCK", "TRUE",
    "FALSE", "ASC", "DESC", "PIVOT", "UNPIVOT", "APPLY", "OVER", "PARTITION", "CURRENT_DATE",
    "CURRENT_TIMESTAMP", "DUMMY", "HINT", "OPTION", "SET", "ANY", "SOME",
];

/// Minimum character-overlap ratio for a fuzzy suggestion.
const SUGGESTION_THRESHOLD: f64 = 0.7;

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(word))
}

fn unquote(identifier: &str) -> &str {
    identifier.trim_matches(|c| c == '[' || c == ']' || c == '"')
}

/// Character-overlap ratio: `2 * shared / (len(a) + len(b))`, case-insensitive.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let total = a.chars().count() + b.chars().count();
    if total == 0 {
        return 0.0;
    }
    let mut counts: HashMap<char, usize> = HashMap::new();
    for ch in a.chars() {
        *counts.entry(ch).or_default() += 1;
    }
    let mut shared = 0;
    for ch in b.chars() {
        if let Some(count) = counts.get_mut(&ch) {
            if *count > 0 {
                *count -= 1;
                shared += 1;
            }
        }
    }
    (2 * shared) as f64 / total as f64
}

/// Closest candidate by overlap ratio, or one containing / contained in `name`.
pub fn suggest<'a>(name: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let lower = name.to_lowercase();
    let mut best: Option<(&str, f64)> = None;
    for candidate in candidates {
        let cand_lower = candidate.to_lowercase();
        if cand_lower == lower {
            continue;
        }
        let ratio = similarity(name, candidate);
        let contains = lower.len() >= 3
            && cand_lower.len() >= 3
            && (cand_lower.contains(&lower) || lower.contains(&cand_lower));
        if ratio >= SUGGESTION_THRESHOLD || contains {
            if best.map_or(true, |(_, best_ratio)| ratio > best_ratio) {
                best = Some((candidate, ratio));
            }
        }
    }
    best.map(|(candidate, _)| candidate)
}

#[derive(Debug)]
struct TableRef {
    schema: Option<String>,
    name: String,
    alias: Option<String>,
}

/// Split on commas that are not nested in parentheses.
fn split_top_level(list: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0;
    let mut start = 0;
    for (idx, ch) in list.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                items.push(list[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    items.push(list[start..].trim());
    items
}

/// Advisory cross-check of identifiers against a schema snapshot.
///
/// Never fatal: the verdict is always valid and every finding is a warning.
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn validate(sql: &str, schema: &SchemaSnapshot) -> ValidationVerdict {
        let mut verdict = ValidationVerdict::valid();
        if schema.is_empty() {
            return verdict;
        }

        let masked = MaskedSql::new(&strip_comments(sql));
        let text = masked.text.as_str();

        let cte_names: HashSet<String> = CTE_NAME
            .captures_iter(text)
            .map(|c| c[1].to_lowercase())
            .collect();

        let refs = Self::table_refs(text, &cte_names);
        // alias or table name (lower-case) -> resolved table
        let mut scope: HashMap<String, &Table> = HashMap::new();
        let mut known_tables: Vec<&Table> = Vec::new();

        for table_ref in &refs {
            match schema.find_table(table_ref.schema.as_deref(), &table_ref.name) {
                Some(table) => {
                    scope.insert(table_ref.name.to_lowercase(), table);
                    if let Some(alias) = &table_ref.alias {
                        scope.insert(alias.to_lowercase(), table);
                    }
                    known_tables.push(table);
                }
                None => {
                    let message = match suggest(&table_ref.name, schema.table_names()) {
                        Some(s) => format!(
                            "table '{}' not found in schema (did you mean '{}'?)",
                            table_ref.name, s
                        ),
                        None => format!("table '{}' not found in schema", table_ref.name),
                    };
                    verdict.add_warning(CoreError::SchemaMismatch(message).to_string());
                }
            }
        }

        let aliases: HashSet<String> = refs
            .iter()
            .filter_map(|r| r.alias.as_ref().map(|a| a.to_lowercase()))
            .chain(cte_names.iter().cloned())
            .collect();

        Self::check_qualified_columns(text, &scope, &mut verdict);

        if !known_tables.is_empty() && known_tables.len() == refs.len() {
            let column_aliases: HashSet<String> = COLUMN_ALIAS
                .captures_iter(text)
                .map(|c| c[1].to_lowercase())
                .collect();
            for column in Self::unqualified_columns(text) {
                let lower = column.to_lowercase();
                if column_aliases.contains(&lower) || aliases.contains(&lower) {
                    continue;
                }
                if known_tables.iter().any(|t| t.column(&column).is_some()) {
                    continue;
                }
                let candidates = known_tables
                    .iter()
                    .flat_map(|t| t.columns.iter().map(|c| c.name.as_str()));
                let message = match suggest(&column, candidates) {
                    Some(s) => format!(
                        "column '{}' not found in referenced tables (did you mean '{}'?)",
                        column, s
                    ),
                    None => format!("column '{}' not found in referenced tables", column),
                };
                verdict.add_warning(CoreError::SchemaMismatch(message).to_string());
            }
        }

        Self::check_join_types(text, &scope, &mut verdict);

        verdict
    }

    fn table_refs(text: &str, cte_names: &HashSet<String>) -> Vec<TableRef> {
        let mut refs = Vec::new();
        for captures in TABLE_REF.captures_iter(text) {
            if !in_query_scope(text, captures.get(0).map_or(0, |m| m.start())) {
                continue;
            }
            let full = &captures[1];
            let parts: Vec<&str> = full.split('.').map(unquote).collect();
            let name = parts.last().copied().unwrap_or_default().to_string();
            if name.is_empty() || name.starts_with('#') || cte_names.contains(&name.to_lowercase()) {
                continue;
            }
            // function-style sources such as SERIES_GENERATE_INTEGER(...) are not tables
            if text[captures.get(1).map_or(0, |m| m.end())..]
                .trim_start()
                .starts_with('(')
            {
                continue;
            }
            let schema = if parts.len() >= 2 {
                Some(parts[parts.len() - 2].to_string())
            } else {
                None
            };
            let alias = captures
                .get(2)
                .map(|m| m.as_str().to_string())
                .filter(|a| !is_reserved(a));
            refs.push(TableRef { schema, name, alias });
        }
        refs
    }

    fn check_qualified_columns(
        text: &str,
        scope: &HashMap<String, &Table>,
        verdict: &mut ValidationVerdict,
    ) {
        for captures in QUALIFIED_COLUMN.captures_iter(text) {
            let qualifier = captures[1].to_lowercase();
            let column = &captures[2];
            // qualifiers that are not in scope are schema names or unknown tables
            let Some(table) = scope.get(&qualifier) else {
                continue;
            };
            if table.column(column).is_some() {
                continue;
            }
            // `schema.table` inside FROM resolves the qualifier to the table itself
            if table.name.eq_ignore_ascii_case(column) {
                continue;
            }
            let candidates = table.columns.iter().map(|c| c.name.as_str());
            let message = match suggest(column, candidates) {
                Some(s) => format!(
                    "column '{}' not found in table '{}' (did you mean '{}'?)",
                    column, table.name, s
                ),
                None => format!("column '{}' not found in table '{}'", column, table.name),
            };
            verdict.add_warning(CoreError::SchemaMismatch(message).to_string());
        }
    }

    fn unqualified_columns(text: &str) -> Vec<String> {
        let mut columns = Vec::new();

        for captures in SELECT_LIST.captures_iter(text) {
            for item in split_top_level(&captures[1]) {
                if let Some(bare) = BARE_ITEM.captures(item) {
                    let name = bare[1].to_string();
                    if !is_reserved(&name) {
                        columns.push(name);
                    }
                }
            }
        }

        for clause in WHERE_CLAUSE.captures_iter(text) {
            for operand in PREDICATE_OPERAND.captures_iter(&clause[1]) {
                let name = &operand[1];
                if !name.contains('.') && !is_reserved(name) {
                    columns.push(name.to_string());
                }
            }
        }

        let mut seen = HashSet::new();
        columns.retain(|c| seen.insert(c.to_lowercase()));
        columns
    }

    fn check_join_types(
        text: &str,
        scope: &HashMap<String, &Table>,
        verdict: &mut ValidationVerdict,
    ) {
        for captures in JOIN_CONDITION.captures_iter(text) {
            let left = scope
                .get(&captures[1].to_lowercase())
                .and_then(|t| t.column(&captures[2]));
            let right = scope
                .get(&captures[3].to_lowercase())
                .and_then(|t| t.column(&captures[4]));
            let (Some(left), Some(right)) = (left, right) else {
                continue;
            };
            let (lf, rf) = (left.family(), right.family());
            if lf != rf && lf != TypeFamily::Other && rf != TypeFamily::Other {
                verdict.add_warning(
                    CoreError::SchemaMismatch(format!(
                        "join compares {}.{} ({}) with {}.{} ({}), which have incompatible types",
                        &captures[1],
                        left.name,
                        left.data_type,
                        &captures[3],
                        right.name,
                        right.data_type
                    ))
                    .to_string(),
                );
            }
        }
    }
}
