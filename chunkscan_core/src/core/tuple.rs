use std::{
    fmt::Display,
    io::{self, Cursor, Read, Write},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{
    db_type::DbType,
    schema::{TupleDesc, bitmap_len},
    support_types::ItemPointer,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Text(String),
}

impl Datum {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn db_type(&self) -> Option<DbType> {
        match self {
            Datum::Null => None,
            Datum::Bool(_) => Some(DbType::BOOL),
            Datum::I32(_) => Some(DbType::I32),
            Datum::I64(_) => Some(DbType::I64),
            Datum::F64(_) => Some(DbType::F64),
            Datum::Text(_) => Some(DbType::STRING),
        }
    }

    /// Encoded size of the value, not counting the tuple header.
    pub fn encoded_size(&self) -> usize {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::I32(_) => 4,
            Datum::I64(_) | Datum::F64(_) => 8,
            Datum::Text(s) => 4 + s.len(),
        }
    }
}

impl Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datum::Null => f.write_str("NULL"),
            Datum::Bool(v) => write!(f, "{}", v),
            Datum::I32(v) => write!(f, "{}", v),
            Datum::I64(v) => write!(f, "{}", v),
            Datum::F64(v) => write!(f, "{}", v),
            Datum::Text(v) => write!(f, "'{}'", v),
        }
    }
}

pub fn encoded_tuple_len(values: &[Datum]) -> usize {
    2 + bitmap_len(values.len()) + values.iter().map(Datum::encoded_size).sum::<usize>()
}

/// Writes one tuple: attribute count, null bitmap (bit set means NULL), then
/// the non-null values in attribute order.
pub fn encode_tuple<W: Write>(desc: &TupleDesc, values: &[Datum], w: &mut W) -> io::Result<()> {
    if values.len() != desc.natts() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("expected {} attributes, got {}", desc.natts(), values.len()),
        ));
    }

    w.write_u16::<LittleEndian>(values.len() as u16)?;

    let mut bitmap = vec![0u8; bitmap_len(values.len())];
    for (i, value) in values.iter().enumerate() {
        if value.is_null() {
            bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    w.write_all(&bitmap)?;

    for (attr, value) in desc.attrs().iter().zip(values) {
        match (attr.db_type, value) {
            (_, Datum::Null) => {}
            (DbType::BOOL, Datum::Bool(v)) => w.write_u8(*v as u8)?,
            (DbType::I32, Datum::I32(v)) => w.write_i32::<LittleEndian>(*v)?,
            (DbType::I64, Datum::I64(v)) => w.write_i64::<LittleEndian>(*v)?,
            (DbType::F64, Datum::F64(v)) => w.write_f64::<LittleEndian>(*v)?,
            (DbType::STRING, Datum::Text(v)) => {
                w.write_u32::<LittleEndian>(v.len() as u32)?;
                w.write_all(v.as_bytes())?;
            }
            (db_type, other) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("attribute {} is {} but value is {:?}", attr.name, db_type, other),
                ));
            }
        }
    }

    Ok(())
}

pub fn decode_tuple(desc: &TupleDesc, bytes: &[u8]) -> io::Result<Vec<Datum>> {
    let mut cursor = Cursor::new(bytes);

    let natts = cursor.read_u16::<LittleEndian>()? as usize;
    if natts != desc.natts() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("tuple has {} attributes, descriptor has {}", natts, desc.natts()),
        ));
    }

    let mut bitmap = vec![0u8; bitmap_len(natts)];
    cursor.read_exact(&mut bitmap)?;

    let mut values = Vec::with_capacity(natts);
    for (i, attr) in desc.attrs().iter().enumerate() {
        if bitmap[i / 8] & (1 << (i % 8)) != 0 {
            values.push(Datum::Null);
            continue;
        }

        let value = match attr.db_type {
            DbType::BOOL => Datum::Bool(cursor.read_u8()? != 0),
            DbType::I32 => Datum::I32(cursor.read_i32::<LittleEndian>()?),
            DbType::I64 => Datum::I64(cursor.read_i64::<LittleEndian>()?),
            DbType::F64 => Datum::F64(cursor.read_f64::<LittleEndian>()?),
            DbType::STRING => {
                let len = cursor.read_u32::<LittleEndian>()? as usize;
                let mut buf = vec![0u8; len];
                cursor.read_exact(&mut buf)?;
                let text = String::from_utf8(buf)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Datum::Text(text)
            }
        };
        values.push(value);
    }

    Ok(values)
}

/// A tuple handed to the scan consumer, together with its row identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanTuple {
    pub ctid: ItemPointer,
    pub values: Vec<Datum>,
}

impl ScanTuple {
    pub fn new(ctid: ItemPointer, values: Vec<Datum>) -> Self {
        ScanTuple { ctid, values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::Attribute;

    fn desc() -> TupleDesc {
        TupleDesc::new(vec![
            Attribute::new("id", DbType::I32),
            Attribute::new("score", DbType::F64),
            Attribute::new("name", DbType::STRING),
            Attribute::new("flag", DbType::BOOL),
        ])
    }

    #[test]
    fn test_encode_with_nulls() {
        let desc = desc();
        let values = vec![
            Datum::I32(7),
            Datum::Null,
            Datum::Text("seven".into()),
            Datum::Bool(true),
        ];

        let mut buf = Vec::new();
        encode_tuple(&desc, &values, &mut buf).unwrap();
        assert_eq!(buf.len(), encoded_tuple_len(&values));
        // null bitmap marks attribute 1
        assert_eq!(buf[2], 0b0000_0010);
        assert_eq!(decode_tuple(&desc, &buf).unwrap(), values);
    }

    #[test]
    fn test_encode_type_mismatch() {
        let desc = desc();
        let values = vec![Datum::I64(7), Datum::Null, Datum::Null, Datum::Null];
        let mut buf = Vec::new();
        let err = encode_tuple(&desc, &values, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_decode_truncated() {
        let desc = desc();
        let values = vec![
            Datum::I32(1),
            Datum::F64(0.5),
            Datum::Text("abc".into()),
            Datum::Bool(false),
        ];
        let mut buf = Vec::new();
        encode_tuple(&desc, &values, &mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(decode_tuple(&desc, &buf).is_err());
    }
}
