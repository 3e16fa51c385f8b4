//! Checkpoint documents and their on-disk store.
//!
//! A checkpoint ties the bytes-read position (sequence + file offset)
//! to the committed SCN watermark, together with everything needed to
//! resume: incarnation list, supplemental-log settings, users and the
//! schema cache. Consecutive documents with an unchanged schema carry
//! a `schema-ref-scn` back-reference instead of the full blob;
//! retention must keep referenced documents alive as long as any
//! survivor points at them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::common::errors::{ReplError, Result};
use crate::common::types::{Activation, FileOffset, Resetlogs, Scn, Seq, Xid};
use crate::metadata::schema::Schema;
use crate::metadata::state::DiskState;

/// Largest accepted checkpoint document (schema blobs included).
pub const CHECKPOINT_FILE_MAX_SIZE: u64 = 2_147_483_648;

const IDENTIFIER_MAX: usize = 128;

/// Oldest still-open transaction at checkpoint time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MinTran {
    pub seq: Seq,
    pub offset: FileOffset,
    pub xid: Xid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OnlineRedo {
    pub group: i64,
    pub path: Vec<String>,
}

/// One database incarnation from V$DATABASE_INCARNATION.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Incarnation {
    pub incarnation: u32,
    pub resetlogs_scn: Scn,
    pub prior_resetlogs_scn: Scn,
    pub status: String,
    pub resetlogs: Resetlogs,
    pub prior_incarnation: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CheckpointDoc {
    pub database: String,
    pub scn: Scn,
    pub seq: Seq,
    pub offset: FileOffset,
    pub resetlogs: Resetlogs,
    pub activation: Activation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tran: Option<MinTran>,
    #[serde(default)]
    pub supp_log_db_primary: bool,
    #[serde(default)]
    pub supp_log_db_all: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub online_redo: Vec<OnlineRedo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incarnations: Vec<Incarnation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
    /// SCN the inline schema was captured at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_scn: Option<Scn>,
    /// Reference to an earlier document carrying the schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_ref_scn: Option<Scn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
}

impl CheckpointDoc {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ReplError::json("checkpoint document", e))
    }

    pub fn from_json(text: &str) -> Result<CheckpointDoc> {
        let doc: CheckpointDoc = serde_json::from_str(text)
            .map_err(|e| ReplError::json("checkpoint document", e))?;
        doc.validate()?;
        Ok(doc)
    }

    fn validate(&self) -> Result<()> {
        if self.database.len() > IDENTIFIER_MAX {
            return Err(ReplError::identifier_too_long("database name", &self.database));
        }
        for user in &self.users {
            if user.len() > IDENTIFIER_MAX {
                return Err(ReplError::identifier_too_long("user name", user));
            }
        }
        if self.schema.is_some() && self.schema_ref_scn.is_some() {
            return Err(ReplError::data(
                20006,
                "checkpoint carries both inline schema and schema-ref-scn",
            ));
        }
        Ok(())
    }

    /// Ensure the document's resetlogs appears in its incarnation list.
    pub fn validate_resetlogs(&self) -> Result<()> {
        if self.incarnations.is_empty() {
            return Ok(());
        }
        if self.incarnations.iter().any(|i| i.resetlogs == self.resetlogs) {
            return Ok(());
        }
        Err(ReplError::data(
            20008,
            format!("resetlogs {} not found in incarnation list", self.resetlogs),
        ))
    }
}

fn doc_name(database: &str, scn: Scn) -> String {
    format!("{database}-chkpt-{scn}")
}

fn parse_doc_scn(name: &str, database: &str) -> Option<Scn> {
    let prefix = format!("{database}-chkpt-");
    name.strip_prefix(&prefix)?.parse::<u64>().ok().map(Scn::new)
}

/// Files on disk, ordered by SCN, with the back-reference each one
/// carries (None for full documents).
pub struct CheckpointStore {
    state: DiskState,
    database: String,
    entries: BTreeMap<Scn, Option<Scn>>,
}

impl CheckpointStore {
    pub fn open(state: DiskState, database: &str) -> Result<CheckpointStore> {
        let mut store = CheckpointStore {
            state,
            database: database.to_string(),
            entries: BTreeMap::new(),
        };
        for name in store.state.list(&format!("{database}-chkpt-"))? {
            if let Some(scn) = parse_doc_scn(&name, database) {
                // The reference is only known after parsing; lazily
                // resolved when retention needs it.
                let doc = store.read_doc(scn)?;
                store.entries.insert(scn, doc.schema_ref_scn);
            }
        }
        if !store.entries.is_empty() {
            info!(
                "found {} checkpoint documents for database: {database}",
                store.entries.len()
            );
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn newest(&self) -> Option<Scn> {
        self.entries.keys().next_back().copied()
    }

    fn read_doc(&self, scn: Scn) -> Result<CheckpointDoc> {
        let text = self
            .state
            .read(&doc_name(&self.database, scn), CHECKPOINT_FILE_MAX_SIZE)?;
        CheckpointDoc::from_json(&text)
    }

    /// Persist a document and prune old files beyond `keep`, retaining
    /// any document still referenced by a survivor.
    pub fn save(&mut self, doc: &CheckpointDoc, keep: u64) -> Result<()> {
        let name = doc_name(&self.database, doc.scn);
        self.state.write(&name, &doc.to_json()?)?;
        self.entries.insert(doc.scn, doc.schema_ref_scn);
        debug!("checkpoint written: {name}");
        self.prune(keep)
    }

    fn prune(&mut self, keep: u64) -> Result<()> {
        if keep == 0 || self.entries.len() <= keep as usize {
            return Ok(());
        }
        let keepers: Vec<Scn> = self
            .entries
            .keys()
            .rev()
            .take(keep as usize)
            .copied()
            .collect();
        let mut retained: std::collections::HashSet<Scn> = keepers.iter().copied().collect();
        for scn in &keepers {
            if let Some(Some(referenced)) = self.entries.get(scn) {
                retained.insert(*referenced);
            }
        }
        let doomed: Vec<Scn> = self
            .entries
            .keys()
            .filter(|scn| !retained.contains(scn))
            .copied()
            .collect();
        for scn in doomed {
            self.state.drop_file(&doc_name(&self.database, scn))?;
            self.entries.remove(&scn);
            debug!("checkpoint pruned: scn {scn}");
        }
        Ok(())
    }

    /// Pick the resume document: the newest with SCN not above
    /// `start_scn`, or the newest overall on a fresh start. Reference
    /// documents are resolved so the result always carries a schema
    /// (when any was ever written).
    pub fn resume(&self, start_scn: Scn) -> Result<Option<CheckpointDoc>> {
        let pick = if start_scn.is_none() {
            self.newest()
        } else {
            self.entries.range(..=start_scn).next_back().map(|(scn, _)| *scn)
        };
        let Some(scn) = pick else {
            return Ok(None);
        };

        let mut doc = self.read_doc(scn)?;
        doc.validate_resetlogs()?;
        if let Some(ref_scn) = doc.schema_ref_scn {
            let referenced = self.read_doc(ref_scn)?;
            if referenced.schema.is_none() {
                return Err(ReplError::data(
                    20007,
                    format!("checkpoint scn {scn} references scn {ref_scn} which has no schema"),
                ));
            }
            doc.schema = referenced.schema;
            doc.schema_scn = referenced.schema_scn.or(Some(ref_scn));
        }
        Ok(Some(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::schema::{col_type, DbColumn, DbTable};
    use tempfile::tempdir;

    fn schema_with_table() -> Schema {
        let mut schema = Schema::new();
        schema.add_table(DbTable {
            obj: 100,
            data_obj: 100,
            owner: "SYS".to_string(),
            name: "T".to_string(),
            columns: vec![DbColumn {
                col_no: 1,
                name: "C".to_string(),
                typ: col_type::NUMBER,
                length: 22,
                precision: None,
                scale: None,
                nullable: true,
                charset_id: 0,
            }],
            lobs: Vec::new(),
            pk: Vec::new(),
            tag_cols: Vec::new(),
            partitions: Vec::new(),
        });
        schema
    }

    fn doc(scn: u64, schema: Option<Schema>, schema_ref: Option<u64>) -> CheckpointDoc {
        CheckpointDoc {
            database: "ORCL".to_string(),
            scn: Scn::new(scn),
            seq: Seq::new(5),
            offset: FileOffset::new(1024),
            resetlogs: 900,
            activation: 77,
            min_tran: None,
            supp_log_db_primary: true,
            supp_log_db_all: false,
            online_redo: Vec::new(),
            incarnations: vec![Incarnation {
                incarnation: 1,
                resetlogs_scn: Scn::new(1),
                prior_resetlogs_scn: Scn::zero(),
                status: "CURRENT".to_string(),
                resetlogs: 900,
                prior_incarnation: 0,
            }],
            users: vec!["SCOTT".to_string()],
            schema_scn: schema.as_ref().map(|_| Scn::new(scn)),
            schema_ref_scn: schema_ref.map(Scn::new),
            schema,
        }
    }

    fn store(dir: &std::path::Path) -> CheckpointStore {
        CheckpointStore::open(DiskState::new(dir).unwrap(), "ORCL").unwrap()
    }

    #[test]
    fn document_roundtrip() {
        let original = doc(100, Some(schema_with_table()), None);
        let text = original.to_json().unwrap();
        let parsed = CheckpointDoc::from_json(&text).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn both_schema_forms_rejected() {
        let mut bad = doc(100, Some(schema_with_table()), None);
        bad.schema_ref_scn = Some(Scn::new(50));
        let text = serde_json::to_string(&bad).unwrap();
        let err = CheckpointDoc::from_json(&text).unwrap_err();
        assert_eq!(err.code(), 20006);
    }

    #[test]
    fn resetlogs_must_match_incarnations() {
        let mut bad = doc(100, None, None);
        bad.resetlogs = 1234;
        assert_eq!(bad.validate_resetlogs().unwrap_err().code(), 20008);
    }

    #[test]
    fn resume_picks_newest_at_or_below_start() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        store.save(&doc(100, Some(schema_with_table()), None), 10).unwrap();
        store.save(&doc(150, None, Some(100)), 10).unwrap();
        store.save(&doc(200, None, Some(100)), 10).unwrap();

        let picked = store.resume(Scn::new(180)).unwrap().unwrap();
        assert_eq!(picked.scn, Scn::new(150));
        // Schema resolved through the reference.
        assert!(picked.schema.is_some());
        assert_eq!(picked.schema_scn, Some(Scn::new(100)));
    }

    #[test]
    fn resume_fresh_start_uses_newest() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        store.save(&doc(100, Some(schema_with_table()), None), 10).unwrap();
        store.save(&doc(130, None, Some(100)), 10).unwrap();
        let picked = store.resume(Scn::none()).unwrap().unwrap();
        assert_eq!(picked.scn, Scn::new(130));
    }

    #[test]
    fn resume_empty_store() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.resume(Scn::none()).unwrap().is_none());
    }

    #[test]
    fn prune_keeps_referenced_documents() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        store.save(&doc(100, Some(schema_with_table()), None), 2).unwrap();
        store.save(&doc(110, None, Some(100)), 2).unwrap();
        store.save(&doc(120, None, Some(100)), 2).unwrap();
        store.save(&doc(130, None, Some(100)), 2).unwrap();

        // 120 and 130 survive by recency, 100 by reference; 110 goes.
        let kept: Vec<u64> = store.entries.keys().map(|s| s.value()).collect();
        assert_eq!(kept, vec![100, 120, 130]);
    }

    #[test]
    fn store_reload_sees_existing_documents() {
        let dir = tempdir().unwrap();
        {
            let mut store = store(dir.path());
            store.save(&doc(100, Some(schema_with_table()), None), 10).unwrap();
        }
        let reopened = store(dir.path());
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.newest(), Some(Scn::new(100)));
    }
}
