//! Denormalized schema cache.
//!
//! Tables are described the way the dictionary views present them:
//! object id, column list with Oracle type numbers, primary-key and
//! tag column positions, LOB descriptors and partition object pairs.
//! The cache is keyed by object id with a secondary (owner, name)
//! index for configuration lookups. The whole structure serializes
//! into the checkpoint document and must round-trip exactly so resume
//! works offline.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Oracle dictionary object id.
pub type ObjId = u32;

/// Oracle internal datatype numbers used by the row decoder.
pub mod col_type {
    pub const VARCHAR2: u32 = 1;
    pub const NUMBER: u32 = 2;
    pub const LONG: u32 = 8;
    pub const DATE: u32 = 12;
    pub const RAW: u32 = 23;
    pub const ROWID: u32 = 69;
    pub const CHAR: u32 = 96;
    pub const CLOB: u32 = 112;
    pub const BLOB: u32 = 113;
    pub const TIMESTAMP: u32 = 180;
    pub const TIMESTAMP_TZ: u32 = 181;
    pub const INTERVAL_YM: u32 = 182;
    pub const INTERVAL_DS: u32 = 183;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DbColumn {
    /// 1-based column position.
    pub col_no: u16,
    pub name: String,
    #[serde(rename = "type")]
    pub typ: u32,
    pub length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<i32>,
    pub nullable: bool,
    #[serde(default)]
    pub charset_id: u16,
}

impl DbColumn {
    pub fn is_lob(&self) -> bool {
        matches!(self.typ, col_type::CLOB | col_type::BLOB)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DbLob {
    /// Column position the LOB belongs to.
    pub col_no: u16,
    /// Object id of the LOB segment.
    pub lob_obj: ObjId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DbTable {
    pub obj: ObjId,
    pub data_obj: ObjId,
    pub owner: String,
    pub name: String,
    pub columns: Vec<DbColumn>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lobs: Vec<DbLob>,
    /// Primary-key column positions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pk: Vec<u16>,
    /// Columns emitted as message tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_cols: Vec<u16>,
    /// (partition obj, partition data obj) pairs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<(ObjId, ObjId)>,
}

impl DbTable {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }

    pub fn column(&self, col_no: u16) -> Option<&DbColumn> {
        self.columns.iter().find(|c| c.col_no == col_no)
    }
}

/// The schema cache. Serializes as a plain table list; the secondary
/// index is rebuilt on load.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    tables: HashMap<ObjId, DbTable>,
    by_name: HashMap<(String, String), ObjId>,
    /// Partition object id to owning table object id.
    partition_map: HashMap<ObjId, ObjId>,
    /// Set when the table set changed since the last full checkpoint.
    pub touched: bool,
    pub loaded: bool,
}

impl Schema {
    pub fn new() -> Schema {
        Schema::default()
    }

    pub fn add_table(&mut self, table: DbTable) {
        self.by_name.insert((table.owner.clone(), table.name.clone()), table.obj);
        for (part_obj, _) in &table.partitions {
            self.partition_map.insert(*part_obj, table.obj);
        }
        self.tables.insert(table.obj, table);
        self.touched = true;
    }

    pub fn drop_table(&mut self, obj: ObjId) -> Option<DbTable> {
        let table = self.tables.remove(&obj)?;
        self.by_name.remove(&(table.owner.clone(), table.name.clone()));
        for (part_obj, _) in &table.partitions {
            self.partition_map.remove(part_obj);
        }
        self.touched = true;
        Some(table)
    }

    /// Resolve an object id, following partition objects to their
    /// owning table.
    pub fn table_by_obj(&self, obj: ObjId) -> Option<&DbTable> {
        if let Some(table) = self.tables.get(&obj) {
            return Some(table);
        }
        self.partition_map.get(&obj).and_then(|owner| self.tables.get(owner))
    }

    pub fn table_by_name(&self, owner: &str, name: &str) -> Option<&DbTable> {
        self.by_name
            .get(&(owner.to_string(), name.to_string()))
            .and_then(|obj| self.tables.get(obj))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn tables(&self) -> impl Iterator<Item = &DbTable> {
        self.tables.values()
    }
}

impl Serialize for Schema {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tables: Vec<&DbTable> = self.tables.values().collect();
        tables.sort_by_key(|t| t.obj);
        let mut doc = serde_json::Map::new();
        doc.insert(
            "tables".to_string(),
            serde_json::to_value(tables).map_err(serde::ser::Error::custom)?,
        );
        serde_json::Value::Object(doc).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Doc {
            tables: Vec<DbTable>,
        }
        let doc = Doc::deserialize(deserializer)?;
        let mut schema = Schema::new();
        for table in doc.tables {
            schema.add_table(table);
        }
        schema.touched = false;
        schema.loaded = true;
        Ok(schema)
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.tables == other.tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn emp_table() -> DbTable {
        DbTable {
            obj: 5001,
            data_obj: 5001,
            owner: "SCOTT".to_string(),
            name: "EMP".to_string(),
            columns: vec![
                DbColumn {
                    col_no: 1,
                    name: "ID".to_string(),
                    typ: col_type::NUMBER,
                    length: 22,
                    precision: Some(10),
                    scale: Some(0),
                    nullable: false,
                    charset_id: 0,
                },
                DbColumn {
                    col_no: 2,
                    name: "NAME".to_string(),
                    typ: col_type::VARCHAR2,
                    length: 10,
                    precision: None,
                    scale: None,
                    nullable: true,
                    charset_id: 873,
                },
            ],
            lobs: Vec::new(),
            pk: vec![1],
            tag_cols: Vec::new(),
            partitions: vec![(5002, 5002)],
        }
    }

    #[test]
    fn lookup_by_obj_and_name() {
        let mut schema = Schema::new();
        schema.add_table(emp_table());
        assert_eq!(schema.table_by_obj(5001).unwrap().name, "EMP");
        assert_eq!(schema.table_by_name("SCOTT", "EMP").unwrap().obj, 5001);
        assert!(schema.table_by_name("SCOTT", "DEPT").is_none());
    }

    #[test]
    fn partition_resolves_to_owner() {
        let mut schema = Schema::new();
        schema.add_table(emp_table());
        assert_eq!(schema.table_by_obj(5002).unwrap().obj, 5001);
    }

    #[test]
    fn drop_clears_indexes() {
        let mut schema = Schema::new();
        schema.add_table(emp_table());
        schema.drop_table(5001).unwrap();
        assert!(schema.table_by_obj(5001).is_none());
        assert!(schema.table_by_obj(5002).is_none());
        assert!(schema.table_by_name("SCOTT", "EMP").is_none());
    }

    #[test]
    fn serde_roundtrip_is_exact() {
        let mut schema = Schema::new();
        schema.add_table(emp_table());
        let json = serde_json::to_string(&schema).unwrap();
        let back: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, back);
        assert!(back.loaded);
        assert!(!back.touched);
    }

    #[test]
    fn column_lookup() {
        let table = emp_table();
        assert_eq!(table.column(2).unwrap().name, "NAME");
        assert!(table.column(9).is_none());
        assert!(!table.column(1).unwrap().is_lob());
    }
}
