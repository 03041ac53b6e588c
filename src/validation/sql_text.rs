//! Lexical helpers shared by the validators and the dialect rules.
//!
//! None of this is a parser. It only knows enough about SQL text to tell
//! string literals, quoted identifiers and comments apart from everything else.

/// Marker wrapped around the index of a masked string literal.
pub const LITERAL_MARK: char = '\u{1}';

/// Remove `--` and `/* */` comments, leaving literals and quoted identifiers intact.
pub fn strip_comments(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            '\'' | '"' | '[' => {
                let end = quoted_end(&chars, i);
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
                out.push(' ');
            }
            _ => {
                out.push(ch);
                i += 1;
            }
        }
    }

    out
}

/// Index one past the end of the quoted run starting at `start`.
/// Doubled quote characters are treated as escapes.
fn quoted_end(chars: &[char], start: usize) -> usize {
    let close = match chars[start] {
        '[' => ']',
        other => other,
    };
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == close {
            if chars.get(i + 1) == Some(&close) && close != ']' {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

/// SQL text with every single-quoted literal replaced by a placeholder.
#[derive(Debug, Clone)]
pub struct MaskedSql {
    pub text: String,
    pub literals: Vec<String>,
}

impl MaskedSql {
    pub fn new(sql: &str) -> Self {
        let chars: Vec<char> = sql.chars().collect();
        let mut text = String::with_capacity(sql.len());
        let mut literals = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '\'' => {
                    let end = quoted_end(&chars, i);
                    literals.push(chars[i..end].iter().collect());
                    text.push(LITERAL_MARK);
                    text.push_str(&(literals.len() - 1).to_string());
                    text.push(LITERAL_MARK);
                    i = end;
                }
                '"' | '[' => {
                    let end = quoted_end(&chars, i);
                    text.extend(&chars[i..end]);
                    i = end;
                }
                ch => {
                    text.push(ch);
                    i += 1;
                }
            }
        }

        Self { text, literals }
    }

    /// Put the original literals back into (possibly rewritten) masked text.
    pub fn restore(&self, masked: &str) -> String {
        let mut out = String::with_capacity(masked.len());
        let mut parts = masked.split(LITERAL_MARK);
        if let Some(head) = parts.next() {
            out.push_str(head);
        }
        // split alternates between literal indices and ordinary text
        while let Some(index) = parts.next() {
            match index.parse::<usize>().ok().and_then(|i| self.literals.get(i)) {
                Some(literal) => out.push_str(literal),
                None => out.push_str(index),
            }
            if let Some(rest) = parts.next() {
                out.push_str(rest);
            }
        }
        out
    }

    /// Literal bodies without the surrounding quotes.
    pub fn literal_bodies(&self) -> impl Iterator<Item = &str> {
        self.literals.iter().map(|l| {
            let inner = l.strip_prefix('\'').unwrap_or(l);
            inner.strip_suffix('\'').unwrap_or(inner)
        })
    }
}

/// First keyword of the statement, upper-cased. Leading parentheses are skipped.
pub fn first_keyword(sql: &str) -> Option<String> {
    let trimmed = sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
    let word: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_alphabetic() || *c == '_')
        .collect();
    if word.is_empty() {
        None
    } else {
        Some(word.to_uppercase())
    }
}

/// Parenthesis depth at every byte offset of `text`.
pub fn depth_at(text: &str, pos: usize) -> i32 {
    let mut depth = 0;
    for (idx, ch) in text.char_indices() {
        if idx >= pos {
            break;
        }
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
    }
    depth
}

/// Byte offset where the group enclosing `pos` ends: the matching `)` of the
/// innermost open parenthesis, or the end of the statement (before any
/// trailing semicolon and whitespace) at depth zero.
pub fn enclosing_group_end(text: &str, pos: usize) -> usize {
    let mut depth = 0;
    for (idx, ch) in text[pos..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                if depth == 0 {
                    return pos + idx;
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    text.trim_end().trim_end_matches(';').trim_end().len()
}

/// Byte offset just after the `(` opening the group that encloses `pos`, or 0.
pub fn enclosing_group_start(text: &str, pos: usize) -> usize {
    let mut depth = 0;
    for (idx, ch) in text[..pos].char_indices().rev() {
        match ch {
            ')' => depth += 1,
            '(' => {
                if depth == 0 {
                    return idx + 1;
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    0
}

/// Whether `pos` sits in a query body rather than inside a function call's
/// argument list, where `FROM` also appears (`TRIM('x' FROM name)`,
/// `EXTRACT(YEAR FROM d)`).
pub fn in_query_scope(text: &str, pos: usize) -> bool {
    let start = enclosing_group_start(text, pos);
    start == 0 || matches!(first_keyword(&text[start..pos]).as_deref(), Some("SELECT" | "WITH"))
}
