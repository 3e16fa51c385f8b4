//! JSON message builder.
//!
//! One message per DML in `single` mode; one message per transaction
//! with a `payload` array in `grouped` mode. Checkpoint events are
//! emitted only when configured, so a plain run produces exactly the
//! row events of committed transactions.

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use serde_json::{json, Map, Value};

use crate::builder::{Builder, EmitContext};
use crate::common::config::{FormatConfig, MessageFormat};
use crate::common::errors::{ReplError, Result};
use crate::common::types::{FileOffset, Scn, Seq, Xid};
use crate::metadata::schema::DbTable;
use crate::parser::row::{RowImage, RowOp};
use crate::writer::Writer;

struct OpenTransaction {
    xid: Xid,
    attributes: Vec<(String, String)>,
    payload: Vec<Value>,
    /// Emit index of the first buffered event, used to address the
    /// grouped message.
    first_idx: u64,
}

pub struct JsonBuilder {
    writer: Box<dyn Writer>,
    format: FormatConfig,
    emit_checkpoints: bool,
    open: Option<OpenTransaction>,
}

impl JsonBuilder {
    pub fn new(writer: Box<dyn Writer>, format: FormatConfig, emit_checkpoints: bool) -> JsonBuilder {
        JsonBuilder { writer, format, emit_checkpoints, open: None }
    }

    fn scn_value(&self, scn: Scn) -> Value {
        if self.format.scn_key {
            Value::String(scn.to_string())
        } else {
            Value::from(scn.value())
        }
    }

    fn timestamp_value(&self, timestamp: i64) -> Value {
        match &self.format.timestamp_format {
            Some(format) => match Utc.timestamp_opt(timestamp, 0).single() {
                Some(dt) => Value::String(dt.format(format).to_string()),
                None => Value::from(timestamp),
            },
            None => Value::from(timestamp),
        }
    }

    fn columns_object(table: &DbTable, values: &[(u16, Value)]) -> Value {
        let mut object = Map::new();
        for (col_no, value) in values {
            let name = table
                .column(*col_no)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| format!("COL_{col_no}"));
            object.insert(name, value.clone());
        }
        Value::Object(object)
    }

    fn dml_value(table: &DbTable, row: &RowImage) -> Value {
        let op = match row.op {
            RowOp::Insert => "c",
            RowOp::Update => "u",
            RowOp::Delete => "d",
        };
        let mut value = json!({
            "op": op,
            "schema": {"owner": table.owner, "table": table.name},
        });
        let object = value.as_object_mut().expect("literal object");
        if !row.before.is_empty() {
            object.insert("before".to_string(), Self::columns_object(table, &row.before));
        }
        if !row.after.is_empty() {
            object.insert("after".to_string(), Self::columns_object(table, &row.after));
        }
        value
    }

    fn envelope(&self, scn: Scn, timestamp: i64, xid: Xid) -> Map<String, Value> {
        let mut envelope = Map::new();
        envelope.insert("scn".to_string(), self.scn_value(scn));
        envelope.insert("tm".to_string(), self.timestamp_value(timestamp));
        envelope.insert("xid".to_string(), Value::String(xid.to_string()));
        if self.format.attributes {
            if let Some(open) = &self.open {
                if !open.attributes.is_empty() {
                    let attrs: Map<String, Value> = open
                        .attributes
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect();
                    envelope.insert("attributes".to_string(), Value::Object(attrs));
                }
            }
        }
        envelope
    }

    fn emit_dml(&mut self, ctx: &EmitContext, event: Value) -> Result<()> {
        match self.format.message_format {
            MessageFormat::Single => {
                let mut envelope = self.envelope(ctx.scn, ctx.timestamp, ctx.xid);
                envelope.insert("payload".to_string(), Value::Array(vec![event]));
                let bytes = serde_json::to_vec(&Value::Object(envelope))
                    .map_err(|e| ReplError::json("building message", e))?;
                self.writer.send(ctx.scn, ctx.idx, Bytes::from(bytes))
            }
            MessageFormat::Grouped => {
                let open = self.open.as_mut().ok_or_else(|| {
                    ReplError::internal(50057, "dml outside of a transaction".to_string())
                })?;
                if open.payload.is_empty() {
                    open.first_idx = ctx.idx;
                }
                open.payload.push(event);
                Ok(())
            }
        }
    }
}

impl Builder for JsonBuilder {
    fn process_begin(
        &mut self,
        _scn: Scn,
        _timestamp: i64,
        xid: Xid,
        attributes: &[(String, String)],
    ) -> Result<()> {
        self.open = Some(OpenTransaction {
            xid,
            attributes: attributes.to_vec(),
            payload: Vec::new(),
            first_idx: 0,
        });
        Ok(())
    }

    fn process_insert(&mut self, ctx: &EmitContext, table: &DbTable, row: &RowImage) -> Result<()> {
        self.emit_dml(ctx, Self::dml_value(table, row))
    }

    fn process_update(&mut self, ctx: &EmitContext, table: &DbTable, row: &RowImage) -> Result<()> {
        self.emit_dml(ctx, Self::dml_value(table, row))
    }

    fn process_delete(&mut self, ctx: &EmitContext, table: &DbTable, row: &RowImage) -> Result<()> {
        self.emit_dml(ctx, Self::dml_value(table, row))
    }

    fn process_ddl(
        &mut self,
        ctx: &EmitContext,
        owner: &str,
        table: &str,
        sql: &str,
    ) -> Result<()> {
        let event = json!({
            "op": "ddl",
            "schema": {"owner": owner, "table": table},
            "sql": sql,
        });
        self.emit_dml(ctx, event)
    }

    fn process_commit(&mut self, scn: Scn, timestamp: i64) -> Result<()> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };
        if self.format.message_format == MessageFormat::Grouped && !open.payload.is_empty() {
            self.open = Some(open);
            let open = self.open.as_ref().expect("just set");
            let mut envelope = self.envelope(scn, timestamp, open.xid);
            envelope.insert("payload".to_string(), Value::Array(open.payload.clone()));
            let bytes = serde_json::to_vec(&Value::Object(envelope))
                .map_err(|e| ReplError::json("building message", e))?;
            let first_idx = open.first_idx;
            self.open = None;
            self.writer.send(scn, first_idx, Bytes::from(bytes))?;
        }
        Ok(())
    }

    fn process_checkpoint(
        &mut self,
        scn: Scn,
        seq: Seq,
        timestamp: i64,
        offset: FileOffset,
        switch_redo: bool,
    ) -> Result<()> {
        if !self.emit_checkpoints {
            return Ok(());
        }
        let message = json!({
            "scn": self.scn_value(scn),
            "tm": self.timestamp_value(timestamp),
            "payload": [{
                "op": "chkpt",
                "seq": seq.value(),
                "offset": offset.value(),
                "redo": switch_redo,
            }],
        });
        let bytes = serde_json::to_vec(&message)
            .map_err(|e| ReplError::json("building message", e))?;
        self.writer.send(scn, 0, Bytes::from(bytes))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::FormatType;
    use crate::metadata::schema::{col_type, DbColumn};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Captures sent messages for inspection.
    struct CaptureWriter {
        messages: Arc<Mutex<Vec<(Scn, u64, Value)>>>,
    }

    impl Writer for CaptureWriter {
        fn send(&mut self, scn: Scn, idx: u64, message: Bytes) -> Result<()> {
            let value: Value = serde_json::from_slice(&message).unwrap();
            self.messages.lock().push((scn, idx, value));
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn capture() -> (Box<dyn Writer>, Arc<Mutex<Vec<(Scn, u64, Value)>>>) {
        let messages = Arc::new(Mutex::new(Vec::new()));
        (Box::new(CaptureWriter { messages: Arc::clone(&messages) }), messages)
    }

    fn table() -> DbTable {
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
                    precision: None,
                    scale: None,
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
            partitions: Vec::new(),
        }
    }

    fn ctx(scn: u64, idx: u64) -> EmitContext {
        EmitContext { scn: Scn::new(scn), idx, xid: Xid::new(1, 2, 3), timestamp: 1_700_000_000 }
    }

    fn insert_row() -> RowImage {
        RowImage {
            op: RowOp::Insert,
            before: Vec::new(),
            after: vec![(1, Value::from(1)), (2, Value::String("A".to_string()))],
        }
    }

    #[test]
    fn single_mode_emits_one_message_per_dml() {
        let (writer, messages) = capture();
        let mut builder = JsonBuilder::new(writer, FormatConfig::default(), false);
        builder
            .process_begin(Scn::new(120), 1_700_000_000, Xid::new(1, 2, 3), &[])
            .unwrap();
        builder.process_insert(&ctx(120, 0), &table(), &insert_row()).unwrap();
        builder.process_commit(Scn::new(120), 1_700_000_000).unwrap();

        let sent = messages.lock();
        assert_eq!(sent.len(), 1);
        let (scn, idx, message) = &sent[0];
        assert_eq!(*scn, Scn::new(120));
        assert_eq!(*idx, 0);
        assert_eq!(message["scn"], Value::from(120));
        assert_eq!(message["xid"], Value::String("0x0001.002.00000003".to_string()));
        assert_eq!(message["payload"][0]["op"], "c");
        assert_eq!(message["payload"][0]["after"]["ID"], Value::from(1));
        assert_eq!(message["payload"][0]["after"]["NAME"], "A");
    }

    #[test]
    fn grouped_mode_emits_one_message_per_transaction() {
        let (writer, messages) = capture();
        let format = FormatConfig {
            message_format: MessageFormat::Grouped,
            ..FormatConfig::default()
        };
        let mut builder = JsonBuilder::new(writer, format, false);
        builder
            .process_begin(Scn::new(130), 1_700_000_000, Xid::new(1, 2, 3), &[])
            .unwrap();
        builder.process_insert(&ctx(130, 0), &table(), &insert_row()).unwrap();
        builder.process_insert(&ctx(130, 1), &table(), &insert_row()).unwrap();
        builder.process_commit(Scn::new(130), 1_700_000_000).unwrap();

        let sent = messages.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2["payload"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn empty_transaction_emits_nothing_in_grouped_mode() {
        let (writer, messages) = capture();
        let format = FormatConfig {
            message_format: MessageFormat::Grouped,
            ..FormatConfig::default()
        };
        let mut builder = JsonBuilder::new(writer, format, false);
        builder
            .process_begin(Scn::new(140), 1_700_000_000, Xid::new(1, 2, 3), &[])
            .unwrap();
        builder.process_commit(Scn::new(140), 1_700_000_000).unwrap();
        assert!(messages.lock().is_empty());
    }

    #[test]
    fn scn_key_renders_scn_as_string() {
        let (writer, messages) = capture();
        let format = FormatConfig { scn_key: true, ..FormatConfig::default() };
        let mut builder = JsonBuilder::new(writer, format, false);
        builder
            .process_begin(Scn::new(150), 1_700_000_000, Xid::new(1, 2, 3), &[])
            .unwrap();
        builder.process_insert(&ctx(150, 0), &table(), &insert_row()).unwrap();
        assert_eq!(messages.lock()[0].2["scn"], Value::String("150".to_string()));
    }

    #[test]
    fn timestamp_format_applies() {
        let (writer, messages) = capture();
        let format = FormatConfig {
            timestamp_format: Some("%Y-%m-%dT%H:%M:%SZ".to_string()),
            ..FormatConfig::default()
        };
        let mut builder = JsonBuilder::new(writer, format, false);
        builder
            .process_begin(Scn::new(160), 1_700_000_000, Xid::new(1, 2, 3), &[])
            .unwrap();
        builder.process_insert(&ctx(160, 0), &table(), &insert_row()).unwrap();
        assert_eq!(
            messages.lock()[0].2["tm"],
            Value::String("2023-11-14T22:13:20Z".to_string())
        );
    }

    #[test]
    fn checkpoints_only_when_enabled() {
        let (writer, messages) = capture();
        let mut builder = JsonBuilder::new(writer, FormatConfig::default(), false);
        builder
            .process_checkpoint(Scn::new(170), Seq::new(4), 1_700_000_000, FileOffset::new(4096), false)
            .unwrap();
        assert!(messages.lock().is_empty());

        let (writer, messages) = capture();
        let mut builder = JsonBuilder::new(writer, FormatConfig::default(), true);
        builder
            .process_checkpoint(Scn::new(170), Seq::new(4), 1_700_000_000, FileOffset::new(4096), true)
            .unwrap();
        let sent = messages.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2["payload"][0]["op"], "chkpt");
        assert_eq!(sent[0].2["payload"][0]["redo"], Value::Bool(true));
    }

    #[test]
    fn attributes_included_when_configured() {
        let (writer, messages) = capture();
        let format = FormatConfig { attributes: true, ..FormatConfig::default() };
        let mut builder = JsonBuilder::new(writer, format, false);
        builder
            .process_begin(
                Scn::new(180),
                1_700_000_000,
                Xid::new(1, 2, 3),
                &[("module".to_string(), "payroll".to_string())],
            )
            .unwrap();
        builder.process_insert(&ctx(180, 0), &table(), &insert_row()).unwrap();
        assert_eq!(
            messages.lock()[0].2["attributes"]["module"],
            Value::String("payroll".to_string())
        );
    }

    #[test]
    fn format_type_default_is_json() {
        assert_eq!(FormatConfig::default().format_type, FormatType::Json);
    }
}
