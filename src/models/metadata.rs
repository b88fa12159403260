use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableType {
    Table,
    View,
    Collection,
}

impl TableType {
    /// Map a catalog `table_type` value onto the shared kinds
    pub fn from_catalog(raw: &str) -> Self {
        match raw.to_uppercase().as_str() {
            "VIEW" | "SYSTEM VIEW" | "MATERIALIZED VIEW" => TableType::View,
            _ => TableType::Table,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaTable {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(rename = "type")]
    pub table_type: TableType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<SchemaColumn>>,
}

impl SchemaTable {
    pub fn new(name: impl Into<String>, schema: Option<String>, table_type: TableType) -> Self {
        Self {
            name: name.into(),
            schema,
            table_type,
            row_count: None,
            size_bytes: None,
            columns: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_table_type() {
        assert_eq!(TableType::from_catalog("BASE TABLE"), TableType::Table);
        assert_eq!(TableType::from_catalog("VIEW"), TableType::View);
        assert_eq!(TableType::from_catalog("system view"), TableType::View);
    }

    #[test]
    fn test_table_serialization() {
        let mut table = SchemaTable::new("users", Some("public".to_string()), TableType::Table);
        table.row_count = Some(42);

        let value = serde_json::to_value(&table).unwrap();
        assert_eq!(value["type"], "table");
        assert_eq!(value["rowCount"], 42);
        assert!(value.get("sizeBytes").is_none());
    }
}
