//! SQL statement classification by leading keyword

use std::fmt;

/// Kind of operation a SQL statement performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlOperation {
    /// Plain query
    Select,
    /// Query that takes row locks (`FOR UPDATE`, `FOR SHARE`, `LOCK IN SHARE MODE`)
    SelectForUpdate,
    /// INSERT / REPLACE
    Insert,
    /// UPDATE
    Update,
    /// DELETE
    Delete,
    /// MERGE / UPSERT
    Merge,
    /// Stored procedure call
    Call,
    /// Schema change (CREATE, ALTER, DROP, TRUNCATE, ...)
    Ddl,
    /// Anything else, including `WITH` (may carry data-modifying CTEs) and
    /// `EXPLAIN` (`EXPLAIN ANALYZE` runs the explained statement)
    Other,
}

impl SqlOperation {
    /// Classify SQL text, case-insensitive, ignoring leading whitespace,
    /// comments and opening parentheses.
    pub fn classify(sql: &str) -> Self {
        let keyword = leading_keyword(sql);
        match keyword.to_ascii_uppercase().as_str() {
            "SELECT" | "SHOW" | "DESCRIBE" | "DESC" | "VALUES" | "TABLE" => {
                if takes_row_locks(sql) {
                    Self::SelectForUpdate
                } else {
                    Self::Select
                }
            }
            "INSERT" | "REPLACE" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "MERGE" | "UPSERT" => Self::Merge,
            "CALL" | "EXEC" | "EXECUTE" => Self::Call,
            "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME" | "COMMENT" | "GRANT"
            | "REVOKE" => Self::Ddl,
            _ => Self::Other,
        }
    }

    /// Whether the statement only reads and takes no locks
    #[inline]
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Select)
    }

    /// Whether the statement modifies rows
    #[inline]
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete | Self::Merge)
    }
}

impl fmt::Display for SqlOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Select => "select",
            Self::SelectForUpdate => "select_for_update",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Merge => "merge",
            Self::Call => "call",
            Self::Ddl => "ddl",
            Self::Other => "other",
        };
        write!(f, "{}", name)
    }
}

/// First keyword of the statement
fn leading_keyword(sql: &str) -> &str {
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b if b.is_ascii_whitespace() || b == b'(' => i += 1,
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 2;
            }
            _ => break,
        }
    }

    let start = i.min(bytes.len());
    let end = bytes[start..]
        .iter()
        .position(|b| !b.is_ascii_alphabetic())
        .map_or(bytes.len(), |p| start + p);
    &sql[start..end]
}

fn takes_row_locks(sql: &str) -> bool {
    let words: Vec<String> = sql
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_uppercase())
        .collect();

    words.windows(2).any(|pair| {
        pair[0] == "FOR"
            && matches!(
                pair[1].as_str(),
                "UPDATE" | "SHARE" | "NO" | "KEY"
            )
    }) || words
        .windows(3)
        .any(|w| w[0] == "IN" && w[1] == "SHARE" && w[2] == "MODE")
}
