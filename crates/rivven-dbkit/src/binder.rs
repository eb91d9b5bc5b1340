//! Parameter binding
//!
//! Values reach a prepared statement in one of three shapes, resolved once
//! per bind:
//! - `Params::Positional`: strict placeholder order
//! - `Params::Named`: a name to value map; keys the SQL does not use are ignored
//! - `Params::Keyed`: any `PropertySource` (a serde value, a map, an entity adapter)

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::connection::PreparedStatement;
use crate::error::{Error, Result};
use crate::parsed_sql::ParsedSql;
use crate::types::Value;

/// Looks up parameter values by name
pub trait PropertySource: Send + Sync {
    /// Value for a parameter name, `None` when the source has no such property
    fn property(&self, name: &str) -> Option<Value>;
}

impl PropertySource for HashMap<String, Value> {
    fn property(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Dotted names walk nested objects: `user.address.city`.
impl PropertySource for serde_json::Value {
    fn property(&self, name: &str) -> Option<Value> {
        let mut current = self;
        for part in name.split('.') {
            current = match current {
                serde_json::Value::Object(map) => map.get(part)?,
                serde_json::Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(Value::from_json(current.clone()))
    }
}

/// Parameter values for one statement execution
#[derive(Clone, Default)]
pub enum Params {
    /// No parameters
    #[default]
    None,
    /// Values in placeholder order
    Positional(Vec<Value>),
    /// Values by parameter name
    Named(HashMap<String, Value>),
    /// Values looked up from a keyed object
    Keyed(Arc<dyn PropertySource>),
}

impl Params {
    /// Positional parameters
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::Positional(values.into_iter().map(Into::into).collect())
    }

    /// Named parameters
    pub fn named<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self::Named(
            values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Keyed parameters from any property source
    pub fn keyed(source: impl PropertySource + 'static) -> Self {
        Self::Keyed(Arc::new(source))
    }

    /// Keyed parameters from a serializable value (a struct, a map, ...)
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let json = serde_json::to_value(value)
            .map_err(|e| Error::type_conversion(format!("cannot serialize parameters: {}", e)))?;
        Ok(Self::Keyed(Arc::new(json)))
    }

    /// Whether no values are supplied
    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Positional(values) => values.is_empty(),
            Self::Named(values) => values.is_empty(),
            Self::Keyed(_) => false,
        }
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Positional(values) => f.debug_tuple("Positional").field(values).finish(),
            Self::Named(values) => f.debug_tuple("Named").field(values).finish(),
            Self::Keyed(_) => write!(f, "Keyed(..)"),
        }
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Self::Positional(values)
    }
}

impl From<HashMap<String, Value>> for Params {
    fn from(values: HashMap<String, Value>) -> Self {
        Self::Named(values)
    }
}

/// Bind a full parameter set onto a statement compiled from `parsed`
pub fn bind_params(
    stmt: &mut dyn PreparedStatement,
    parsed: &ParsedSql,
    params: &Params,
) -> Result<()> {
    match params {
        Params::None => {
            if parsed.parameter_count() == 0 {
                return Ok(());
            }
            match parsed.named_parameters().first() {
                Some(name) => Err(Error::missing_parameter(name.clone())),
                None => Err(Error::config(format!(
                    "statement expects {} parameters, none supplied",
                    parsed.parameter_count()
                ))),
            }
        }
        Params::Positional(values) => bind_positional(stmt, parsed, values),
        Params::Named(values) => bind_lookup(stmt, parsed, |name| values.get(name).cloned()),
        Params::Keyed(source) => bind_lookup(stmt, parsed, |name| source.property(name)),
    }
}

/// Bind values in strict placeholder order
pub fn bind_positional(
    stmt: &mut dyn PreparedStatement,
    parsed: &ParsedSql,
    values: &[Value],
) -> Result<()> {
    if values.len() != parsed.parameter_count() {
        return Err(Error::config(format!(
            "statement expects {} parameters, got {}",
            parsed.parameter_count(),
            values.len()
        )));
    }
    for (i, value) in values.iter().enumerate() {
        stmt.set_value(i + 1, value.clone())?;
    }
    Ok(())
}

fn bind_lookup<F>(stmt: &mut dyn PreparedStatement, parsed: &ParsedSql, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<Value>,
{
    if !parsed.is_named() && parsed.parameter_count() > 0 {
        return Err(Error::config(
            "named values supplied for a statement with '?' placeholders",
        ));
    }

    let mut resolved: HashMap<&str, Value> = HashMap::new();
    for (i, name) in parsed.named_parameters().iter().enumerate() {
        let value = match resolved.get(name.as_str()) {
            Some(value) => value.clone(),
            None => {
                let value = lookup(name).ok_or_else(|| Error::missing_parameter(name.clone()))?;
                resolved.insert(name.as_str(), value.clone());
                value
            }
        };
        stmt.set_value(i + 1, value)?;
    }
    Ok(())
}

/// Bind one value at every position of `name`.
///
/// On `UnknownParameter` the statement may already hold other values; the
/// caller owns the statement and must still close it.
pub fn bind_name(
    stmt: &mut dyn PreparedStatement,
    parsed: &ParsedSql,
    name: &str,
    value: Value,
) -> Result<()> {
    let indices = parsed.indices_of(name);
    let Some((&last, rest)) = indices.split_last() else {
        return Err(Error::unknown_parameter(name));
    };
    for &index in rest {
        stmt.set_value(index, value.clone())?;
    }
    stmt.set_value(last, value)
}
