use crate::types::{CellId, Scalar, ScalarType, TableId, ValueId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level schema document parsed from a schema file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<serde_json::Value>,
}

/// Type constraint, and optional default, for a single cell or value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSchema {
    #[serde(rename = "type")]
    pub scalar_type: ScalarType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Scalar>,
}

pub type ValueSchema = CellSchema;
pub type TableSchema = BTreeMap<CellId, CellSchema>;
pub type TablesSchema = BTreeMap<TableId, TableSchema>;
pub type ValuesSchema = BTreeMap<ValueId, ValueSchema>;

impl CellSchema {
    pub fn new(scalar_type: ScalarType) -> Self {
        CellSchema {
            scalar_type,
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Scalar>) -> Self {
        self.default = Some(default.into());
        self
    }
}
