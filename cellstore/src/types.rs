use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

pub type Id = String;
pub type TableId = Id;
pub type RowId = Id;
pub type CellId = Id;
pub type ValueId = Id;

pub type Row = BTreeMap<CellId, Scalar>;
pub type Table = BTreeMap<RowId, Row>;
pub type Tables = BTreeMap<TableId, Table>;
pub type Values = BTreeMap<ValueId, Scalar>;

/// The full content of a store: its tables and its keyed values.
pub type Content = (Tables, Values);

/// Which slice of a table's row ids to return, and in what order.
///
/// Rows sort by `cell_id` when set, otherwise by row id. `offset` rows are
/// skipped and at most `limit` returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortedRowIdsArgs {
    pub table_id: TableId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<CellId>,
    #[serde(default)]
    pub descending: bool,
    #[serde(default)]
    pub offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl SortedRowIdsArgs {
    pub fn new(table_id: impl Into<TableId>) -> Self {
        SortedRowIdsArgs {
            table_id: table_id.into(),
            ..Default::default()
        }
    }

    pub fn by(mut self, cell_id: impl Into<CellId>) -> Self {
        self.cell_id = Some(cell_id.into());
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A stored cell or value. Numbers are always finite.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Boolean(bool),
    Number(f64),
    String(String),
}

/// The type tag a schema constrains a cell or value to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    String,
    Number,
    Boolean,
}

impl ScalarType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(ScalarType::String),
            "number" => Some(ScalarType::Number),
            "boolean" => Some(ScalarType::Boolean),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScalarType::String => "string",
            ScalarType::Number => "number",
            ScalarType::Boolean => "boolean",
        }
    }
}

impl Scalar {
    /// Convert an untyped candidate into a storable scalar, if it is one.
    /// Non-finite numbers, nulls, arrays and objects are not storable.
    pub fn from_json(value: &serde_json::Value) -> Option<Scalar> {
        match value {
            serde_json::Value::String(s) => Some(Scalar::String(s.clone())),
            serde_json::Value::Bool(b) => Some(Scalar::Boolean(*b)),
            serde_json::Value::Number(n) => {
                n.as_f64().filter(|f| f.is_finite()).map(Scalar::Number)
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::String(s) => serde_json::Value::String(s.clone()),
            Scalar::Boolean(b) => serde_json::Value::Bool(*b),
            Scalar::Number(n) => number_to_json(*n),
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Scalar::String(_) => ScalarType::String,
            Scalar::Number(_) => ScalarType::Number,
            Scalar::Boolean(_) => ScalarType::Boolean,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Scalar::Boolean(_) => 0,
            Scalar::Number(_) => 1,
            Scalar::String(_) => 2,
        }
    }
}

/// Total order used when sorting rows by a cell: absent cells first, then
/// booleans, numbers and strings, each in their natural order.
pub fn compare_sort_keys(a: Option<&Scalar>, b: Option<&Scalar>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Scalar::Boolean(x), Scalar::Boolean(y)) => x.cmp(y),
            (Scalar::Number(x), Scalar::Number(y)) => x.total_cmp(y),
            (Scalar::String(x), Scalar::String(y)) => x.cmp(y),
            _ => a.type_rank().cmp(&b.type_rank()),
        },
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    // 2^53: integral floats below this round-trip exactly through i64
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Scalar::String(s) => serializer.serialize_str(s),
            Scalar::Boolean(b) => serializer.serialize_bool(*b),
            Scalar::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
                    serializer.serialize_i64(*n as i64)
                } else {
                    serializer.serialize_f64(*n)
                }
            }
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::String(s) => write!(f, "{s}"),
            Scalar::Boolean(b) => write!(f, "{b}"),
            Scalar::Number(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::String(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::String(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Boolean(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Number(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Number(f64::from(value))
    }
}

impl From<Scalar> for serde_json::Value {
    fn from(value: Scalar) -> Self {
        value.to_json()
    }
}

impl From<&Scalar> for serde_json::Value {
    fn from(value: &Scalar) -> Self {
        value.to_json()
    }
}
