//! Top-level statement splitting for generated DDL.

/// Marker PostgreSQL uses to quote function and trigger bodies.
pub const DEFAULT_BLOCK_MARKER: &str = "$$";

/// Splits a payload on semicolons that are not inside a delimited block.
///
/// One marker both opens and closes a block, so a single flag tracks whether
/// the scan is inside one. Distinct or nested markers are not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementSplitter {
    marker: String,
}

impl Default for StatementSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_MARKER)
    }
}

impl StatementSplitter {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Split `payload` into executable statements, without the terminating
    /// semicolons. Blank and comment-only fragments are dropped; a payload
    /// without a top-level semicolon comes back as one statement.
    pub fn split(&self, payload: &str) -> Vec<String> {
        let bytes = payload.as_bytes();
        let marker = self.marker.as_bytes();
        let mut statements = Vec::new();
        let mut inside_block = false;
        let mut start = 0;
        let mut i = 0;

        while i < bytes.len() {
            if !marker.is_empty() && bytes[i..].starts_with(marker) {
                inside_block = !inside_block;
                i += marker.len();
                continue;
            }
            if bytes[i] == b';' && !inside_block {
                push_statement(&mut statements, &payload[start..i]);
                start = i + 1;
            }
            i += 1;
        }
        push_statement(&mut statements, &payload[start..]);

        statements
    }
}

fn push_statement(statements: &mut Vec<String>, fragment: &str) {
    let trimmed = fragment.trim();
    if !is_blank_or_comment(trimmed) {
        statements.push(trimmed.to_string());
    }
}

/// Only whitespace and `--` line comments.
fn is_blank_or_comment(fragment: &str) -> bool {
    fragment
        .lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_statements() {
        let s = StatementSplitter::default();
        assert_eq!(s.split("A; B; C;"), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_block_semicolons_do_not_split() {
        let s = StatementSplitter::default();
        let payload = "CREATE FUNCTION f() RETURNS trigger AS $$ BEGIN x; y; END; $$ LANGUAGE plpgsql; \
                       CREATE INDEX idx_t ON t (c);";
        let statements = s.split(payload);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE FUNCTION"));
        assert!(statements[0].ends_with("LANGUAGE plpgsql"));
        assert_eq!(statements[1], "CREATE INDEX idx_t ON t (c)");
    }

    #[test]
    fn test_custom_marker() {
        let s = StatementSplitter::new("//");
        let statements = s.split("CREATE PROCEDURE p() // BEGIN a; b; END // ; CALL p();");
        assert_eq!(
            statements,
            vec!["CREATE PROCEDURE p() // BEGIN a; b; END //", "CALL p()"]
        );
    }

    #[test]
    fn test_no_semicolon_is_single_statement() {
        let s = StatementSplitter::default();
        assert_eq!(
            s.split("  CREATE TABLE t (id int)\n"),
            vec!["CREATE TABLE t (id int)"]
        );
    }

    #[test]
    fn test_trailing_and_empty_fragments_dropped() {
        let s = StatementSplitter::default();
        assert_eq!(s.split("A;;  ;\n B ;  \n\n"), vec!["A", "B"]);
        assert!(s.split("").is_empty());
        assert!(s.split(" ; ;").is_empty());
    }

    #[test]
    fn test_comment_only_fragments_dropped() {
        let s = StatementSplitter::default();
        let payload = "-- indexes\nCREATE INDEX a ON t (x);\n-- done\n;";
        assert_eq!(s.split(payload), vec!["-- indexes\nCREATE INDEX a ON t (x)"]);
    }

    #[test]
    fn test_concatenated_index_batch_is_split() {
        let s = StatementSplitter::default();
        let payload = "CREATE INDEX a ON t (x); CREATE INDEX b ON t (y); CREATE INDEX c ON t (z);";
        assert_eq!(s.split(payload).len(), 3);
    }

    #[test]
    fn test_unclosed_block_keeps_remainder() {
        let s = StatementSplitter::default();
        let statements = s.split("SELECT 1; DO $$ BEGIN x; y;");
        assert_eq!(statements, vec!["SELECT 1", "DO $$ BEGIN x; y;"]);
    }

    #[test]
    fn test_multibyte_text_is_preserved() {
        let s = StatementSplitter::default();
        let statements = s.split("DO $$ BEGIN RAISE NOTICE 'café; ok'; END $$; SELECT 'naïve';");
        assert_eq!(
            statements,
            vec!["DO $$ BEGIN RAISE NOTICE 'café; ok'; END $$", "SELECT 'naïve'"]
        );
    }
}
