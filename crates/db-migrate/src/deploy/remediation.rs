//! Known recoverable error signatures and their statement rewrites.
//!
//! Entries are checked in order. The first one whose predicate matches the
//! error text and whose rewrite actually changes the statement wins.

use std::fmt;

type ErrorPredicate = Box<dyn Fn(&str) -> bool + Send + Sync>;
type Rewrite = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// One (error predicate, statement rewrite) pair.
pub struct Remediation {
    name: String,
    matches: ErrorPredicate,
    rewrite: Rewrite,
}

impl Remediation {
    pub fn new<P, R>(name: impl Into<String>, matches: P, rewrite: R) -> Self
    where
        P: Fn(&str) -> bool + Send + Sync + 'static,
        R: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            matches: Box::new(matches),
            rewrite: Box::new(rewrite),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, error: &str) -> bool {
        (self.matches)(error)
    }

    pub fn rewrite(&self, statement: &str) -> Option<String> {
        (self.rewrite)(statement)
    }
}

impl fmt::Debug for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remediation").field("name", &self.name).finish()
    }
}

/// Ordered list of remediations.
#[derive(Debug)]
pub struct RemediationTable {
    entries: Vec<Remediation>,
}

impl Default for RemediationTable {
    fn default() -> Self {
        Self::empty()
            .with(Remediation::new(
                "spatial_index_gist",
                |err| err.to_lowercase().contains("no default operator class"),
                rewrite_index_method_to_gist,
            ))
            .with(Remediation::new(
                "backtick_identifiers",
                |err| err.contains("at or near \"`\""),
                |stmt| stmt.contains('`').then(|| stmt.replace('`', "\"")),
            ))
            .with(Remediation::new(
                "unsigned_modifier",
                |err| err.to_lowercase().contains("at or near \"unsigned\""),
                |stmt| remove_keyword(stmt, "unsigned"),
            ))
            .with(Remediation::new(
                "mysql_table_options",
                |err| {
                    let err = err.to_lowercase();
                    ["engine", "charset", "auto_increment", "collate", "default"]
                        .iter()
                        .any(|kw| err.contains(&format!("at or near \"{}\"", kw)))
                },
                strip_table_options,
            ))
    }
}

impl RemediationTable {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append an entry (builder style).
    pub fn with(mut self, remediation: Remediation) -> Self {
        self.entries.push(remediation);
        self
    }

    pub fn push(&mut self, remediation: Remediation) {
        self.entries.push(remediation);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First remediation matching `error` that produces a different statement.
    pub fn find(&self, error: &str, statement: &str) -> Option<(&Remediation, String)> {
        self.entries
            .iter()
            .filter(|r| r.matches(error))
            .find_map(|r| {
                r.rewrite(statement)
                    .filter(|rewritten| rewritten != statement)
                    .map(|rewritten| (r, rewritten))
            })
    }
}

/// Statement failed because the object is already present.
pub fn is_already_exists(error: &str) -> bool {
    error.to_lowercase().contains("already exists")
}

/// Switch a CREATE INDEX to the GiST access method.
///
/// Replaces an explicit `USING <method>`, otherwise inserts `USING GIST`
/// before the column list that follows `ON <table>`.
pub fn rewrite_index_method_to_gist(statement: &str) -> Option<String> {
    let lower = statement.to_ascii_lowercase();
    if !lower.trim_start().starts_with("create") || find_keyword(&lower, "index").is_none() {
        return None;
    }

    if let Some(using) = find_keyword(&lower, "using") {
        let after = using + "using".len();
        let rest = &lower[after..];
        let method_start = after + (rest.len() - rest.trim_start().len());
        let method_len = lower[method_start..]
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(lower.len() - method_start);
        if &lower[method_start..method_start + method_len] == "gist" {
            return None;
        }
        return Some(format!(
            "{}GIST{}",
            &statement[..method_start],
            &statement[method_start + method_len..]
        ));
    }

    let on = find_keyword(&lower, "on")?;
    let paren = on + lower[on..].find('(')?;
    Some(format!(
        "{} USING GIST {}",
        statement[..paren].trim_end(),
        &statement[paren..]
    ))
}

/// Drop MySQL table options (ENGINE=, DEFAULT CHARSET=, ...) after the column list.
fn strip_table_options(statement: &str) -> Option<String> {
    let lower = statement.to_ascii_lowercase();
    let close = lower.rfind(')')?;
    let tail = &lower[close + 1..];
    let has_options = ["engine", "charset", "auto_increment", "collate", "comment"]
        .iter()
        .any(|kw| find_keyword(tail, kw).is_some());
    has_options.then(|| statement[..=close].to_string())
}

/// Remove every standalone occurrence of `keyword` (case-insensitive).
fn remove_keyword(statement: &str, keyword: &str) -> Option<String> {
    let mut result = statement.to_string();
    let mut removed = false;
    while let Some(pos) = find_keyword(&result.to_ascii_lowercase(), keyword) {
        let start = result[..pos].trim_end().len();
        result.replace_range(start..pos + keyword.len(), "");
        removed = true;
    }
    removed.then_some(result)
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Byte offset of `word` in `haystack` as a whole word. Both lowercase.
fn find_keyword(haystack: &str, word: &str) -> Option<usize> {
    let bytes = haystack.as_bytes();
    let mut from = 0;
    while let Some(rel) = haystack[from..].find(word) {
        let start = from + rel;
        let end = start + word.len();
        let before_ok = start == 0 || !is_ident_byte(bytes[start - 1]);
        let after_ok = end == bytes.len() || !is_ident_byte(bytes[end]);
        if before_ok && after_ok {
            return Some(start);
        }
        from = start + 1;
    }
    None
}
