use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Typed schema tree built once per schema fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub schemas: Vec<Schema>,
    pub retrieved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub tables: Vec<Table>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub is_nullable: bool,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

/// Coarse type grouping used when comparing join operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Numeric,
    String,
    Date,
    Other,
}

impl TypeFamily {
    pub fn of(data_type: &str) -> Self {
        let lower = data_type.to_lowercase();
        let base = lower.split('(').next().unwrap_or_default().trim();
        match base {
            "int" | "integer" | "bigint" | "smallint" | "tinyint" | "decimal" | "numeric"
            | "float" | "real" | "double" | "smalldecimal" | "money" | "smallmoney" | "bit" => {
                TypeFamily::Numeric
            }
            "char" | "varchar" | "nchar" | "nvarchar" | "text" | "ntext" | "alphanum"
            | "shorttext" | "clob" | "nclob" | "string" => TypeFamily::String,
            "date" | "time" | "datetime" | "datetime2" | "smalldatetime" | "datetimeoffset"
            | "timestamp" | "seconddate" => TypeFamily::Date,
            _ => TypeFamily::Other,
        }
    }
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.primary_key.iter().any(|c| c.eq_ignore_ascii_case(name))
            || self
                .foreign_keys
                .iter()
                .any(|fk| fk.column.eq_ignore_ascii_case(name))
    }
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable: true,
        }
    }

    pub fn family(&self) -> TypeFamily {
        TypeFamily::of(&self.data_type)
    }
}

impl SchemaSnapshot {
    pub fn new(schemas: Vec<Schema>) -> Self {
        Self {
            schemas,
            retrieved_at: Some(Utc::now()),
        }
    }

    /// Convenience constructor for a single-schema snapshot.
    pub fn single(schema: impl Into<String>, tables: Vec<Table>) -> Self {
        Self::new(vec![Schema {
            name: schema.into(),
            tables,
        }])
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.iter().all(|s| s.tables.is_empty())
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.schemas.iter().flat_map(|s| s.tables.iter())
    }

    /// Case-insensitive lookup; `schema` narrows the search when given.
    pub fn find_table(&self, schema: Option<&str>, name: &str) -> Option<&Table> {
        self.schemas
            .iter()
            .filter(|s| schema.map_or(true, |wanted| s.name.eq_ignore_ascii_case(wanted)))
            .flat_map(|s| s.tables.iter())
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables().map(|t| t.name.as_str()).collect()
    }

    /// Insert or extend a table while assembling a snapshot from catalog rows.
    pub(crate) fn table_entry(&mut self, schema: &str, table: &str) -> &mut Table {
        let schema_idx = match self.schemas.iter().position(|s| s.name == schema) {
            Some(idx) => idx,
            None => {
                self.schemas.push(Schema {
                    name: schema.to_string(),
                    tables: Vec::new(),
                });
                self.schemas.len() - 1
            }
        };
        let tables = &mut self.schemas[schema_idx].tables;
        let table_idx = match tables.iter().position(|t| t.name == table) {
            Some(idx) => idx,
            None => {
                tables.push(Table::new(table, Vec::new()));
                tables.len() - 1
            }
        };
        &mut tables[table_idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_families() {
        assert_eq!(TypeFamily::of("NVARCHAR(50)"), TypeFamily::String);
        assert_eq!(TypeFamily::of("decimal(18,2)"), TypeFamily::Numeric);
        assert_eq!(TypeFamily::of("SECONDDATE"), TypeFamily::Date);
        assert_eq!(TypeFamily::of("varbinary"), TypeFamily::Other);
    }

    #[test]
    fn test_find_table_is_case_insensitive() {
        let snapshot = SchemaSnapshot::single(
            "dbo",
            vec![Table::new("Products", vec![Column::new("Price", "money")])],
        );
        let table = snapshot.find_table(None, "products").unwrap();
        assert!(table.column("PRICE").is_some());
        assert!(snapshot.find_table(Some("sales"), "Products").is_none());
    }

    #[test]
    fn test_table_entry_groups_rows() {
        let mut snapshot = SchemaSnapshot::default();
        snapshot
            .table_entry("dbo", "Orders")
            .columns
            .push(Column::new("id", "int"));
        snapshot
            .table_entry("dbo", "Orders")
            .columns
            .push(Column::new("total", "money"));
        snapshot.table_entry("hr", "Employees");

        assert_eq!(snapshot.schemas.len(), 2);
        assert_eq!(snapshot.find_table(Some("dbo"), "Orders").unwrap().columns.len(), 2);
    }
}
