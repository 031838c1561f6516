//! SQL text handling and literal rendering.

mod literal;
mod splitter;

pub use literal::{build_insert_sql, quote_ident, qualify, sql_value_to_literal};
pub use splitter::{StatementSplitter, DEFAULT_BLOCK_MARKER};
