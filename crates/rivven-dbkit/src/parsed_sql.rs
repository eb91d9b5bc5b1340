//! Named SQL compilation
//!
//! `ParsedSql` turns SQL written with named placeholders into positional SQL:
//!
//! ```text
//! SELECT * FROM users WHERE a = :x OR b = :x AND c = #{y}
//! SELECT * FROM users WHERE a = ?  OR b = ?  AND c = ?
//! named parameters: [x, x, y]
//! ```
//!
//! Quoted strings, quoted identifiers and comments are copied verbatim, so a
//! `:name` inside a literal is not a parameter. `::` (PostgreSQL cast) is not
//! a placeholder either. Plain `?` placeholders are accepted, but cannot be
//! mixed with named ones.

use dashmap::DashMap;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::classify::SqlOperation;
use crate::error::{Error, Result};

/// Below this many placeholders, name lookups scan the name list instead of
/// building a `BindingPlan`.
const MIN_PARAMETERS_FOR_PLAN: usize = 5;

/// How positional placeholders are written for a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlaceholderStyle {
    /// `?` (JDBC, MySQL, SQLite)
    #[default]
    QuestionMark,
    /// `$1`, `$2`, ... (PostgreSQL)
    Dollar,
    /// `@p1`, `@p2`, ... (SQL Server)
    AtP,
}

impl PlaceholderStyle {
    /// Placeholder for a 1-based parameter index
    pub fn placeholder(&self, index: usize) -> Cow<'static, str> {
        match self {
            Self::QuestionMark => Cow::Borrowed("?"),
            Self::Dollar => Cow::Owned(format!("${}", index)),
            Self::AtP => Cow::Owned(format!("@p{}", index)),
        }
    }
}

/// Name to positional-index map for one `ParsedSql`
#[derive(Debug, Clone, Default)]
pub struct BindingPlan {
    indices: HashMap<String, Vec<usize>>,
}

impl BindingPlan {
    fn build(names: &[String]) -> Self {
        let mut indices: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, name) in names.iter().enumerate() {
            indices.entry(name.clone()).or_default().push(i + 1);
        }
        Self { indices }
    }

    /// 1-based positions of a name, in order of appearance
    pub fn indices_of(&self, name: &str) -> Option<&[usize]> {
        self.indices.get(name).map(Vec::as_slice)
    }

    /// Number of distinct names
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether the plan has no names
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Compiled form of one SQL text
#[derive(Debug)]
pub struct ParsedSql {
    sql: String,
    /// Literal text around placeholders; always `parameter_count + 1` chunks
    segments: Vec<String>,
    parameterized_sql: String,
    named_parameters: Vec<String>,
    parameter_count: usize,
    operation: SqlOperation,
    plan: OnceLock<BindingPlan>,
}

impl ParsedSql {
    /// Compile SQL text
    pub fn parse(sql: &str) -> Result<Self> {
        let scanned = Scanner::new(sql).scan()?;

        if scanned.positional > 0 && !scanned.names.is_empty() {
            return Err(Error::config(format!(
                "cannot mix '?' and named placeholders in: {}",
                sql
            )));
        }

        let parameter_count = scanned.segments.len() - 1;
        debug_assert!(scanned.names.is_empty() || scanned.names.len() == parameter_count);

        let parameterized_sql = render(&scanned.segments, PlaceholderStyle::QuestionMark);

        Ok(Self {
            sql: sql.to_string(),
            segments: scanned.segments,
            parameterized_sql,
            named_parameters: scanned.names,
            parameter_count,
            operation: SqlOperation::classify(sql),
            plan: OnceLock::new(),
        })
    }

    /// The original SQL text
    #[inline]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// SQL with `?` placeholders
    #[inline]
    pub fn parameterized_sql(&self) -> &str {
        &self.parameterized_sql
    }

    /// SQL with placeholders in the given style
    pub fn positional_sql(&self, style: PlaceholderStyle) -> Cow<'_, str> {
        match style {
            PlaceholderStyle::QuestionMark => Cow::Borrowed(&self.parameterized_sql),
            other => Cow::Owned(render(&self.segments, other)),
        }
    }

    /// Parameter names in placeholder order, repeats included
    #[inline]
    pub fn named_parameters(&self) -> &[String] {
        &self.named_parameters
    }

    /// Total number of placeholders
    #[inline]
    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    /// Whether placeholders are named (as opposed to plain `?`)
    #[inline]
    pub fn is_named(&self) -> bool {
        !self.named_parameters.is_empty()
    }

    /// Operation kind of the statement
    #[inline]
    pub fn operation(&self) -> SqlOperation {
        self.operation
    }

    /// The cached binding plan, built on first use
    pub fn binding_plan(&self) -> &BindingPlan {
        self.plan
            .get_or_init(|| BindingPlan::build(&self.named_parameters))
    }

    /// 1-based positions of a parameter name; empty if the name is unknown
    pub fn indices_of(&self, name: &str) -> Cow<'_, [usize]> {
        if self.parameter_count < MIN_PARAMETERS_FOR_PLAN {
            let found: Vec<usize> = self
                .named_parameters
                .iter()
                .enumerate()
                .filter(|(_, n)| n.as_str() == name)
                .map(|(i, _)| i + 1)
                .collect();
            return Cow::Owned(found);
        }

        match self.binding_plan().indices_of(name) {
            Some(indices) => Cow::Borrowed(indices),
            None => Cow::Owned(Vec::new()),
        }
    }

    /// Whether the binding plan has been built
    pub fn has_binding_plan(&self) -> bool {
        self.plan.get().is_some()
    }
}

fn render(segments: &[String], style: PlaceholderStyle) -> String {
    let capacity = segments.iter().map(String::len).sum::<usize>() + segments.len() * 4;
    let mut out = String::with_capacity(capacity);
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            out.push_str(&style.placeholder(i));
        }
        out.push_str(segment);
    }
    out
}

struct Scanned {
    segments: Vec<String>,
    names: Vec<String>,
    positional: usize,
}

struct Scanner<'a> {
    sql: &'a str,
    bytes: &'a [u8],
    pos: usize,
    current: String,
    out: Scanned,
}

impl<'a> Scanner<'a> {
    fn new(sql: &'a str) -> Self {
        Self {
            sql,
            bytes: sql.as_bytes(),
            pos: 0,
            current: String::with_capacity(sql.len()),
            out: Scanned {
                segments: Vec::new(),
                names: Vec::new(),
                positional: 0,
            },
        }
    }

    fn scan(mut self) -> Result<Scanned> {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                q @ (b'\'' | b'"' | b'`') => self.quoted(q)?,
                b'-' if self.peek(1) == Some(b'-') => self.line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.block_comment()?,
                b':' if self.peek(1) == Some(b':') => self.copy(2),
                b':' if self.peek(1).is_some_and(is_name_start) => {
                    let name = self.name(self.pos + 1);
                    self.pos += 1 + name.len();
                    self.placeholder(Some(name));
                }
                b'#' if self.peek(1) == Some(b'{') => self.hash_placeholder()?,
                b'?' => {
                    self.pos += 1;
                    self.out.positional += 1;
                    self.placeholder(None);
                }
                _ => self.copy_char(),
            }
        }

        self.out.segments.push(std::mem::take(&mut self.current));
        Ok(self.out)
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn copy(&mut self, len: usize) {
        let end = (self.pos + len).min(self.bytes.len());
        self.current.push_str(&self.sql[self.pos..end]);
        self.pos = end;
    }

    fn copy_char(&mut self) {
        let len = self.sql[self.pos..]
            .chars()
            .next()
            .map_or(1, char::len_utf8);
        self.copy(len);
    }

    fn placeholder(&mut self, name: Option<String>) {
        self.out.segments.push(std::mem::take(&mut self.current));
        if let Some(name) = name {
            self.out.names.push(name);
        }
    }

    /// `'...'`, `"..."` or `` `...` ``; a doubled quote escapes itself.
    fn quoted(&mut self, quote: u8) -> Result<()> {
        let start = self.pos;
        let mut i = self.pos + 1;
        loop {
            match self.bytes.get(i) {
                None => {
                    let kind = if quote == b'\'' { "string literal" } else { "quoted identifier" };
                    return Err(Error::parse(format!("unterminated {}", kind), start));
                }
                Some(&b) if b == quote => {
                    if self.bytes.get(i + 1) == Some(&quote) {
                        i += 2;
                    } else {
                        i += 1;
                        break;
                    }
                }
                Some(_) => i += 1,
            }
        }
        self.copy(i - start);
        Ok(())
    }

    fn line_comment(&mut self) {
        let len = self.bytes[self.pos..]
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(self.bytes.len() - self.pos);
        self.copy(len);
    }

    fn block_comment(&mut self) -> Result<()> {
        let start = self.pos;
        let body = &self.sql[self.pos + 2..];
        match body.find("*/") {
            Some(end) => {
                self.copy(end + 4);
                Ok(())
            }
            None => Err(Error::parse("unterminated block comment", start)),
        }
    }

    fn hash_placeholder(&mut self) -> Result<()> {
        let start = self.pos;
        let body = &self.sql[self.pos + 2..];
        let end = body
            .find('}')
            .ok_or_else(|| Error::parse("unterminated #{...} placeholder", start))?;
        let name = body[..end].trim();
        if name.is_empty() || !name.bytes().all(is_name_char) {
            return Err(Error::parse(
                format!("invalid parameter name '{}'", name),
                start,
            ));
        }
        let name = name.to_string();
        self.pos += end + 3;
        self.placeholder(Some(name));
        Ok(())
    }

    /// Name starting at `from`; dots are allowed between name characters.
    fn name(&self, from: usize) -> String {
        let mut end = from;
        while end < self.bytes.len() && is_name_char(self.bytes[end]) {
            end += 1;
        }
        while end > from && self.bytes[end - 1] == b'.' {
            end -= 1;
        }
        self.sql[from..end].to_string()
    }
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}

/// Bounded cache of compiled SQL keyed by the raw text
pub struct ParsedSqlCache {
    entries: DashMap<String, Arc<ParsedSql>>,
    capacity: usize,
}

impl ParsedSqlCache {
    /// Create a cache holding at most `capacity` entries (0 disables caching)
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Compile `sql`, reusing a cached result when present
    pub fn get_or_parse(&self, sql: &str) -> Result<Arc<ParsedSql>> {
        if let Some(parsed) = self.entries.get(sql) {
            return Ok(Arc::clone(&parsed));
        }

        let parsed = Arc::new(ParsedSql::parse(sql)?);
        if self.capacity == 0 {
            return Ok(parsed);
        }

        if self.entries.len() >= self.capacity {
            let victim = self.entries.iter().next().map(|e| e.key().clone());
            if let Some(victim) = victim {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(sql.to_string(), Arc::clone(&parsed));
        Ok(parsed)
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl std::fmt::Debug for ParsedSqlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParsedSqlCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
