//! Row reconstruction.
//!
//! Turns a paired (change, undo) vector into column-indexed before and
//! after images for one table. Column bytes are decoded by the Oracle
//! type of the schema column: NUMBER from the base-100 wire format
//! with full precision kept as a decimal string where IEEE doubles
//! would lose digits, strings as UTF-8, RAW as hex, DATE from the
//! 7-byte century-excess form.

use serde_json::Value;
use tracing::warn;

use crate::common::errors::{ReplError, Result};
use crate::common::types::Endian;
use crate::metadata::schema::{col_type, DbColumn, DbTable};
use crate::parser::opcode::{self, OpCode, Vector};

/// The row operation an emitted image describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

/// Column-indexed before/after values for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowImage {
    pub op: RowOp,
    /// (column position, value); absent columns were not logged.
    pub before: Vec<(u16, Value)>,
    pub after: Vec<(u16, Value)>,
}

/// Decode an Oracle NUMBER. Byte 0 carries sign and the base-100
/// exponent (excess 64); the remaining bytes are base-100 digits,
/// stored minus one for positives and as 101-minus-digit with a 102
/// terminator for negatives.
pub fn decode_number(bytes: &[u8]) -> Result<String> {
    if bytes.is_empty() {
        return Err(ReplError::data(20010, "empty NUMBER value"));
    }
    if bytes == [0x80] {
        return Ok("0".to_string());
    }
    // -1e126 sentinel for negative infinity, 1e126 for positive.
    if bytes == [0xFF, 0x65] {
        return Ok("Infinity".to_string());
    }
    if bytes == [0x00] {
        return Ok("-Infinity".to_string());
    }

    let positive = bytes[0] & 0x80 != 0;
    let exponent: i32 = if positive {
        (bytes[0] & 0x7F) as i32 - 65
    } else {
        62 - (bytes[0] & 0x7F) as i32
    };

    let mut digits = Vec::new();
    for &b in &bytes[1..] {
        if !positive && b == 102 {
            break;
        }
        let digit = if positive { b.wrapping_sub(1) } else { 101u8.wrapping_sub(b) };
        if digit > 99 {
            return Err(ReplError::data(20010, format!("bad NUMBER digit: {b}")));
        }
        digits.push(digit);
    }
    if digits.is_empty() {
        return Err(ReplError::data(20010, "NUMBER with no digits"));
    }

    // digits[0] * 100^exponent + digits[1] * 100^(exponent-1) + ...
    let mut text = String::new();
    if !positive {
        text.push('-');
    }
    let int_pairs = exponent + 1;
    if int_pairs <= 0 {
        text.push_str("0.");
        for _ in int_pairs..0 {
            text.push_str("00");
        }
        for (i, d) in digits.iter().enumerate() {
            if i == 0 {
                text.push_str(&format!("{d:02}"));
            } else {
                text.push_str(&format!("{d:02}"));
            }
        }
        trim_fraction(&mut text);
    } else {
        for (i, d) in digits.iter().enumerate() {
            if (i as i32) == int_pairs {
                text.push('.');
            }
            if i == 0 {
                text.push_str(&d.to_string());
            } else {
                text.push_str(&format!("{d:02}"));
            }
        }
        for _ in digits.len() as i32..int_pairs {
            text.push_str("00");
        }
        trim_fraction(&mut text);
    }
    Ok(text)
}

fn trim_fraction(text: &mut String) {
    if text.contains('.') {
        while text.ends_with('0') {
            text.pop();
        }
        if text.ends_with('.') {
            text.pop();
        }
    }
}

/// Encode a decimal string into the NUMBER wire form (fixtures and the
/// schema tooling use this as the exact inverse of [`decode_number`]).
pub fn encode_number(text: &str) -> Result<Vec<u8>> {
    let negative = text.starts_with('-');
    let digits_text = text.trim_start_matches('-');
    if digits_text.chars().any(|c| c != '.' && !c.is_ascii_digit()) {
        return Err(ReplError::data(20010, format!("bad decimal: {text}")));
    }
    let (int_part, frac_part) = match digits_text.split_once('.') {
        Some((i, f)) => (i.to_string(), f.to_string()),
        None => (digits_text.to_string(), String::new()),
    };
    let int_part = int_part.trim_start_matches('0').to_string();
    if int_part.is_empty() && frac_part.chars().all(|c| c == '0') {
        return Ok(vec![0x80]);
    }

    // Align to base-100 pairs around the decimal point.
    let mut padded_int = int_part.clone();
    if padded_int.len() % 2 == 1 {
        padded_int.insert(0, '0');
    }
    let mut padded_frac = frac_part.clone();
    if padded_frac.len() % 2 == 1 {
        padded_frac.push('0');
    }

    let mut pairs: Vec<u8> = Vec::new();
    for i in (0..padded_int.len()).step_by(2) {
        pairs.push(padded_int[i..i + 2].parse().expect("digit pair"));
    }
    let int_pairs = pairs.len() as i32;
    for i in (0..padded_frac.len()).step_by(2) {
        pairs.push(padded_frac[i..i + 2].parse().expect("digit pair"));
    }
    // Strip leading/trailing zero pairs, tracking the exponent.
    let mut exponent = int_pairs - 1;
    let mut start = 0;
    while start < pairs.len() && pairs[start] == 0 {
        start += 1;
        exponent -= 1;
    }
    let mut end = pairs.len();
    while end > start && pairs[end - 1] == 0 {
        end -= 1;
    }
    let pairs = &pairs[start..end];

    let mut out = Vec::with_capacity(pairs.len() + 2);
    if !negative {
        out.push((exponent + 65) as u8 | 0x80);
        for &d in pairs {
            out.push(d + 1);
        }
    } else {
        out.push((62 - exponent) as u8);
        for &d in pairs {
            out.push(101 - d);
        }
        if pairs.len() < 20 {
            out.push(102);
        }
    }
    Ok(out)
}

/// Decode the Oracle 7-byte DATE form.
pub fn decode_date(bytes: &[u8]) -> Result<String> {
    if bytes.len() < 7 {
        return Err(ReplError::data(20010, "short DATE value"));
    }
    let year = (bytes[0] as i32 - 100) * 100 + (bytes[1] as i32 - 100);
    Ok(format!(
        "{year:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        bytes[2],
        bytes[3],
        bytes[4].wrapping_sub(1),
        bytes[5].wrapping_sub(1),
        bytes[6].wrapping_sub(1)
    ))
}

/// Encode a (year, month, day, hour, minute, second) into DATE form.
pub fn encode_date(year: i32, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Vec<u8> {
    vec![
        (year / 100 + 100) as u8,
        (year % 100 + 100) as u8,
        month,
        day,
        hour + 1,
        minute + 1,
        second + 1,
    ]
}

/// Decode raw column bytes by schema type.
pub fn decode_column(column: &DbColumn, bytes: &[u8]) -> Result<Value> {
    match column.typ {
        col_type::NUMBER => {
            let text = decode_number(bytes)?;
            match text.parse::<i64>() {
                Ok(n) => Ok(Value::from(n)),
                // Precision beyond i64/f64 survives as a string.
                Err(_) => match text.parse::<f64>() {
                    Ok(f) if format!("{f}") == text => Ok(Value::from(f)),
                    _ => Ok(Value::String(text)),
                },
            }
        }
        col_type::VARCHAR2 | col_type::CHAR | col_type::LONG => {
            Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        col_type::RAW => Ok(Value::String(
            bytes.iter().map(|b| format!("{b:02X}")).collect::<String>(),
        )),
        col_type::DATE | col_type::TIMESTAMP => Ok(Value::String(decode_date(bytes)?)),
        col_type::ROWID => Ok(Value::String(String::from_utf8_lossy(bytes).into_owned())),
        other => {
            warn!(
                code = 60015,
                "unsupported column type: {other} for column: {}, emitting raw", column.name
            );
            Ok(Value::String(
                bytes.iter().map(|b| format!("{b:02X}")).collect::<String>(),
            ))
        }
    }
}

fn column_by_position<'a>(table: &'a DbTable, col_no: u16) -> Result<&'a DbColumn> {
    table.column(col_no).ok_or_else(|| {
        ReplError::data(
            20010,
            format!("column {col_no} not in table {}", table.full_name()),
        )
    })
}

/// Before-image columns carried by a 5.1 undo vector.
fn undo_columns(
    undo: &Vector<'_>,
    table: &DbTable,
    endian: Endian,
) -> Result<Vec<(u16, Value)>> {
    let supp = opcode::supp_header(undo, endian)?;
    let cols = opcode::column_numbers(undo, supp.cc as usize, endian)?;
    let mut values = Vec::with_capacity(cols.len());
    for (i, col_no) in cols.iter().enumerate() {
        match undo.fields.get(2 + i).copied().flatten() {
            Some(bytes) => {
                let column = column_by_position(table, *col_no)?;
                values.push((*col_no, decode_column(column, bytes)?));
            }
            None => values.push((*col_no, Value::Null)),
        }
    }
    Ok(values)
}

/// Reconstruct row images from a change vector and its optional paired
/// undo vector. Multi-row inserts produce one image per row.
pub fn reconstruct_rows(
    change: &Vector<'_>,
    undo: Option<&Vector<'_>>,
    table: &DbTable,
    endian: Endian,
) -> Result<Vec<RowImage>> {
    match change.op {
        OpCode::Insert => {
            let kdo = opcode::kdo_header(change, endian)?;
            let mut after = Vec::with_capacity(kdo.cc as usize);
            for col in 0..kdo.cc {
                let col_no = col + 1;
                match change.fields.get(1 + col as usize).copied().flatten() {
                    Some(bytes) => {
                        let column = column_by_position(table, col_no)?;
                        after.push((col_no, decode_column(column, bytes)?));
                    }
                    None => after.push((col_no, Value::Null)),
                }
            }
            Ok(vec![RowImage { op: RowOp::Insert, before: Vec::new(), after }])
        }
        OpCode::MultiInsert => {
            let kdo = opcode::kdo_header(change, endian)?;
            let mut rows = Vec::with_capacity(kdo.nrow as usize);
            for row in 0..kdo.nrow {
                let mut after = Vec::with_capacity(kdo.cc as usize);
                for col in 0..kdo.cc {
                    let col_no = col + 1;
                    let field_idx = 1 + (row * kdo.cc + col) as usize;
                    match change.fields.get(field_idx).copied().flatten() {
                        Some(bytes) => {
                            let column = column_by_position(table, col_no)?;
                            after.push((col_no, decode_column(column, bytes)?));
                        }
                        None => after.push((col_no, Value::Null)),
                    }
                }
                rows.push(RowImage { op: RowOp::Insert, before: Vec::new(), after });
            }
            Ok(rows)
        }
        OpCode::Update => {
            let kdo = opcode::kdo_header(change, endian)?;
            let cols = opcode::column_numbers(change, kdo.cc as usize, endian)?;
            let mut after = Vec::with_capacity(cols.len());
            for (i, col_no) in cols.iter().enumerate() {
                match change.fields.get(2 + i).copied().flatten() {
                    Some(bytes) => {
                        let column = column_by_position(table, *col_no)?;
                        after.push((*col_no, decode_column(column, bytes)?));
                    }
                    None => after.push((*col_no, Value::Null)),
                }
            }
            let before = match undo {
                Some(undo) => undo_columns(undo, table, endian)?,
                None => {
                    warn!(
                        code = 60016,
                        "update without supplemental before-image for table: {}",
                        table.full_name()
                    );
                    Vec::new()
                }
            };
            Ok(vec![RowImage { op: RowOp::Update, before, after }])
        }
        OpCode::Delete => {
            let before = match undo {
                Some(undo) => undo_columns(undo, table, endian)?,
                None => {
                    warn!(
                        code = 60016,
                        "delete without supplemental before-image for table: {}",
                        table.full_name()
                    );
                    Vec::new()
                }
            };
            Ok(vec![RowImage { op: RowOp::Delete, before, after: Vec::new() }])
        }
        OpCode::Lock => Ok(Vec::new()),
        other => Err(ReplError::internal(
            50055,
            format!("row reconstruction for non-DML opcode: {other:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::Xid;
    use crate::metadata::schema::DbLob;
    use crate::parser::opcode::VectorBuilder;

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
            lobs: vec![DbLob { col_no: 2, lob_obj: 6001 }],
            pk: vec![1],
            tag_cols: Vec::new(),
            partitions: Vec::new(),
        }
    }

    #[test]
    fn number_decode_basics() {
        assert_eq!(decode_number(&[0x80]).unwrap(), "0");
        assert_eq!(decode_number(&[0xC1, 0x02]).unwrap(), "1");
        assert_eq!(decode_number(&[0xC1, 0x0B]).unwrap(), "10");
        assert_eq!(decode_number(&[0xC2, 0x02]).unwrap(), "100");
        assert_eq!(decode_number(&[0xC2, 0x02, 0x18]).unwrap(), "123");
        assert_eq!(decode_number(&[0x3E, 0x64, 102]).unwrap(), "-1");
        assert_eq!(decode_number(&[0xC0, 0x33]).unwrap(), "0.5");
    }

    #[test]
    fn number_roundtrip() {
        for text in ["0", "1", "42", "100", "123", "9999", "0.5", "0.25", "123.456", "-1", "-250", "-0.01"] {
            let encoded = encode_number(text).unwrap();
            assert_eq!(decode_number(&encoded).unwrap(), text, "value {text}");
        }
    }

    #[test]
    fn number_precision_beyond_ieee() {
        let text = "12345678901234567890123456789012345678";
        let encoded = encode_number(text).unwrap();
        assert_eq!(decode_number(&encoded).unwrap(), text);
    }

    #[test]
    fn date_roundtrip() {
        let bytes = encode_date(2024, 3, 15, 10, 30, 0);
        assert_eq!(decode_date(&bytes).unwrap(), "2024-03-15 10:30:00");
    }

    #[test]
    fn insert_image() {
        let endian = Endian::Little;
        let mut change = VectorBuilder::new(OpCode::Insert, Xid::new(1, 2, 3));
        change.obj = 5001;
        change.fields = vec![
            Some(vec![2, 0, 1, 0, 0x2C, 0]),
            Some(encode_number("1").unwrap()),
            Some(b"A".to_vec()),
        ];
        let bytes = change.encode(endian);
        let vector = opcode::decode_vector(&bytes, endian).unwrap();

        let rows = reconstruct_rows(&vector, None, &table(), endian).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].op, RowOp::Insert);
        assert_eq!(rows[0].after[0], (1, Value::from(1)));
        assert_eq!(rows[0].after[1], (2, Value::String("A".to_string())));
        assert!(rows[0].before.is_empty());
    }

    #[test]
    fn insert_with_null_column() {
        let endian = Endian::Little;
        let mut change = VectorBuilder::new(OpCode::Insert, Xid::new(1, 2, 3));
        change.obj = 5001;
        change.fields = vec![
            Some(vec![2, 0, 1, 0, 0x2C, 0]),
            Some(encode_number("7").unwrap()),
            None,
        ];
        let bytes = change.encode(endian);
        let vector = opcode::decode_vector(&bytes, endian).unwrap();
        let rows = reconstruct_rows(&vector, None, &table(), endian).unwrap();
        assert_eq!(rows[0].after[1], (2, Value::Null));
    }

    #[test]
    fn update_with_supplemental_before() {
        let endian = Endian::Little;
        let xid = Xid::new(1, 2, 3);

        let mut change = VectorBuilder::new(OpCode::Update, xid);
        change.obj = 5001;
        change.fields = vec![
            Some(vec![1, 0, 1, 0, 0, 0]),
            Some(vec![2, 0]),
            Some(b"B".to_vec()),
        ];
        let change_bytes = change.encode(endian);

        let mut undo = VectorBuilder::new(OpCode::Undo, xid);
        undo.obj = 5001;
        undo.fields = vec![
            Some(vec![1, 0]),
            Some(vec![2, 0]),
            Some(b"A".to_vec()),
        ];
        let undo_bytes = undo.encode(endian);

        let change_vec = opcode::decode_vector(&change_bytes, endian).unwrap();
        let undo_vec = opcode::decode_vector(&undo_bytes, endian).unwrap();
        let rows = reconstruct_rows(&change_vec, Some(&undo_vec), &table(), endian).unwrap();
        assert_eq!(rows[0].op, RowOp::Update);
        assert_eq!(rows[0].before, vec![(2, Value::String("A".to_string()))]);
        assert_eq!(rows[0].after, vec![(2, Value::String("B".to_string()))]);
    }

    #[test]
    fn delete_uses_undo_image() {
        let endian = Endian::Little;
        let xid = Xid::new(1, 2, 3);
        let mut change = VectorBuilder::new(OpCode::Delete, xid);
        change.obj = 5001;
        change.fields = vec![Some(vec![0, 0, 1, 0, 0x2C, 0])];
        let change_bytes = change.encode(endian);

        let mut undo = VectorBuilder::new(OpCode::Undo, xid);
        undo.fields = vec![
            Some(vec![2, 0]),
            Some(vec![1, 0, 2, 0]),
            Some(encode_number("1").unwrap()),
            Some(b"A".to_vec()),
        ];
        let undo_bytes = undo.encode(endian);

        let change_vec = opcode::decode_vector(&change_bytes, endian).unwrap();
        let undo_vec = opcode::decode_vector(&undo_bytes, endian).unwrap();
        let rows = reconstruct_rows(&change_vec, Some(&undo_vec), &table(), endian).unwrap();
        assert_eq!(rows[0].op, RowOp::Delete);
        assert_eq!(rows[0].before[0], (1, Value::from(1)));
        assert_eq!(rows[0].before[1], (2, Value::String("A".to_string())));
        assert!(rows[0].after.is_empty());
    }

    #[test]
    fn multi_insert_produces_one_image_per_row() {
        let endian = Endian::Little;
        let mut change = VectorBuilder::new(OpCode::MultiInsert, Xid::new(4, 0, 2));
        change.obj = 5001;
        change.fields = vec![
            Some(vec![2, 0, 2, 0, 0, 0]),
            Some(encode_number("1").unwrap()),
            Some(b"A".to_vec()),
            Some(encode_number("2").unwrap()),
            Some(b"B".to_vec()),
        ];
        let bytes = change.encode(endian);
        let vector = opcode::decode_vector(&bytes, endian).unwrap();
        let rows = reconstruct_rows(&vector, None, &table(), endian).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].after[0], (1, Value::from(1)));
        assert_eq!(rows[1].after[1], (2, Value::String("B".to_string())));
    }

    #[test]
    fn lock_emits_nothing() {
        let endian = Endian::Little;
        let mut change = VectorBuilder::new(OpCode::Lock, Xid::new(1, 1, 1));
        change.fields = vec![Some(vec![0, 0, 0, 0, 0, 0])];
        let bytes = change.encode(endian);
        let vector = opcode::decode_vector(&bytes, endian).unwrap();
        assert!(reconstruct_rows(&vector, None, &table(), endian).unwrap().is_empty());
    }
}
