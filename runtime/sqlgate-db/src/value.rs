//! Parameters going into a statement and the rows coming back out.

use rusqlite::Statement;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};

const NAMED_PREFIXES: [char; 3] = [':', '@', '$'];

/// Bound values for a statement. Values are always bound, never spliced into
/// the statement text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    #[default]
    None,
    Positional(Vec<JsonValue>),
    Named(Map<String, JsonValue>),
}

impl Params {
    pub fn is_empty(&self) -> bool {
        match self {
            Params::None => true,
            Params::Positional(values) => values.is_empty(),
            Params::Named(values) => values.is_empty(),
        }
    }

    /// Looks up a value for the 1-based parameter `index` carrying `name`
    /// (with its `:`/`@`/`$` prefix) in the statement.
    pub(crate) fn lookup(&self, index: usize, name: Option<&str>) -> Option<&JsonValue> {
        match self {
            Params::None => None,
            Params::Positional(values) => index.checked_sub(1).and_then(|idx| values.get(idx)),
            Params::Named(values) => {
                let name = name?;
                values
                    .get(name)
                    .or_else(|| values.get(name.trim_start_matches(NAMED_PREFIXES)))
            }
        }
    }

    pub(crate) fn bind(&self, stmt: &mut Statement<'_>) -> rusqlite::Result<()> {
        let expected = stmt.parameter_count();
        match self {
            Params::None => {
                if expected > 0 {
                    return Err(rusqlite::Error::InvalidParameterCount(0, expected));
                }
            }
            Params::Positional(values) => {
                if values.len() != expected {
                    return Err(rusqlite::Error::InvalidParameterCount(values.len(), expected));
                }
                for (idx, value) in values.iter().enumerate() {
                    stmt.raw_bind_parameter(idx + 1, to_sql_value(value))?;
                }
            }
            Params::Named(values) => {
                let mut bound = vec![false; expected];
                for (key, value) in values {
                    let index = named_index(stmt, key)?
                        .ok_or_else(|| rusqlite::Error::InvalidParameterName(key.clone()))?;
                    stmt.raw_bind_parameter(index, to_sql_value(value))?;
                    if let Some(slot) = bound.get_mut(index - 1) {
                        *slot = true;
                    }
                }
                if let Some(missing) = bound.iter().position(|done| !done) {
                    let name = stmt
                        .parameter_name(missing + 1)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("?{}", missing + 1));
                    return Err(rusqlite::Error::InvalidParameterName(name));
                }
            }
        }
        Ok(())
    }
}

fn named_index(stmt: &Statement<'_>, key: &str) -> rusqlite::Result<Option<usize>> {
    if key.starts_with(NAMED_PREFIXES) {
        return stmt.parameter_index(key);
    }
    for prefix in NAMED_PREFIXES {
        if let Some(index) = stmt.parameter_index(&format!("{prefix}{key}"))? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

pub(crate) fn to_sql_value(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        JsonValue::Number(number) => match number.as_i64() {
            Some(int) => SqlValue::Integer(int),
            None => SqlValue::Real(number.as_f64().unwrap_or_default()),
        },
        JsonValue::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// One column value of a result row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(#[serde(with = "serde_bytes")] Vec<u8>),
    /// A binary-JSON value decoded back into its logical JSON form.
    Json(JsonValue),
}

impl CellValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            CellValue::Null => JsonValue::Null,
            CellValue::Integer(value) => JsonValue::from(*value),
            CellValue::Real(value) => JsonValue::from(*value),
            CellValue::Text(value) => JsonValue::from(value.as_str()),
            CellValue::Blob(bytes) => JsonValue::from(bytes.clone()),
            CellValue::Json(value) => value.clone(),
        }
    }
}

impl From<ValueRef<'_>> for CellValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => CellValue::Null,
            ValueRef::Integer(int) => CellValue::Integer(int),
            ValueRef::Real(real) => CellValue::Real(real),
            ValueRef::Text(text) => CellValue::Text(String::from_utf8_lossy(text).into_owned()),
            ValueRef::Blob(bytes) => CellValue::Blob(bytes.to_vec()),
        }
    }
}

/// A result row keyed by column name. A repeated column name overwrites the
/// earlier value and keeps the earlier position, like a cursor's dict rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    entries: Vec<(String, CellValue)>,
}

impl Row {
    pub fn insert(&mut self, column: impl Into<String>, value: CellValue) {
        let column = column.into();
        match self.entries.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.entries
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, column: &str) -> Option<&mut CellValue> {
        self.entries
            .iter_mut()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.entries
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Outcome of one `Execute` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExecutionResult {
    Rows(Vec<Row>),
    Affected { affected_rows: u64 },
}

impl ExecutionResult {
    pub fn rows(&self) -> &[Row] {
        match self {
            ExecutionResult::Rows(rows) => rows,
            ExecutionResult::Affected { .. } => &[],
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            ExecutionResult::Rows(rows) => rows,
            ExecutionResult::Affected { .. } => Vec::new(),
        }
    }

    pub fn affected_rows(&self) -> Option<u64> {
        match self {
            ExecutionResult::Affected { affected_rows } => Some(*affected_rows),
            ExecutionResult::Rows(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use serde_json::json;

    #[test]
    fn params_deserialize_from_wire_shapes() {
        let positional: Params = serde_json::from_value(json!([1, "a"])).expect("positional");
        assert_eq!(positional, Params::Positional(vec![json!(1), json!("a")]));
        let named: Params = serde_json::from_value(json!({"name": "a"})).expect("named");
        assert!(matches!(named, Params::Named(_)));
        let none: Params = serde_json::from_value(JsonValue::Null).expect("null");
        assert!(none.is_empty());
    }

    #[test]
    fn named_lookup_accepts_prefixed_and_bare_keys() {
        let params: Params = serde_json::from_value(json!({"metadata": "{}"})).expect("named");
        assert_eq!(params.lookup(1, Some(":metadata")), Some(&json!("{}")));
        assert_eq!(params.lookup(1, Some("@metadata")), Some(&json!("{}")));
        assert_eq!(params.lookup(1, Some(":other")), None);
        let positional = Params::Positional(vec![json!(1), json!(2)]);
        assert_eq!(positional.lookup(2, None), Some(&json!(2)));
        assert_eq!(positional.lookup(3, None), None);
    }

    #[test]
    fn bind_rejects_wrong_positional_count() {
        let conn = Connection::open_in_memory().expect("open");
        let mut stmt = conn.prepare("SELECT ?, ?").expect("prepare");
        let err = Params::Positional(vec![json!(1)])
            .bind(&mut stmt)
            .expect_err("count mismatch");
        assert!(matches!(err, rusqlite::Error::InvalidParameterCount(1, 2)));
    }

    #[test]
    fn bind_named_reports_missing_parameter() {
        let conn = Connection::open_in_memory().expect("open");
        let mut stmt = conn.prepare("SELECT :a, :b").expect("prepare");
        let params: Params = serde_json::from_value(json!({"a": 1})).expect("named");
        let err = params.bind(&mut stmt).expect_err("missing :b");
        assert!(matches!(err, rusqlite::Error::InvalidParameterName(name) if name == ":b"));
    }

    #[test]
    fn row_duplicate_columns_keep_last_value() {
        let mut row = Row::default();
        row.insert("id", CellValue::Integer(1));
        row.insert("name", CellValue::Text("a".into()));
        row.insert("id", CellValue::Integer(2));
        assert_eq!(row.len(), 2);
        assert_eq!(row.get("id"), Some(&CellValue::Integer(2)));
        let names: Vec<&str> = row.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["id", "name"]);
        assert_eq!(
            serde_json::to_value(&row).expect("json"),
            json!({"id": 2, "name": "a"})
        );
    }

    #[test]
    fn affected_result_serializes_as_single_mapping() {
        let result = ExecutionResult::Affected { affected_rows: 3 };
        assert_eq!(
            serde_json::to_value(&result).expect("json"),
            json!({"affected_rows": 3})
        );
        assert!(result.rows().is_empty());
    }
}
