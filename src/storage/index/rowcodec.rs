// Copyright 2025 Rangekv Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Row payload codec for indexed entities
//!
//! Vector and document rows are stored in the Data CF as self-contained
//! binary payloads so the index on_commit path can rebuild the typed row
//! from the committed bytes alone.

use rustc_hash::FxHashMap;

use crate::core::{DocumentWithId, Error, Result, ScalarValue, VectorWithId};

const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_TEXT: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;

fn put_scalar(buf: &mut Vec<u8>, value: &ScalarValue) {
    match value {
        ScalarValue::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(*b as u8);
        }
        ScalarValue::Int(i) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&i.to_be_bytes());
        }
        ScalarValue::Float(f) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&f.to_be_bytes());
        }
        ScalarValue::Text(s) => {
            buf.push(TAG_TEXT);
            put_bytes(buf, s.as_bytes());
        }
        ScalarValue::Bytes(b) => {
            buf.push(TAG_BYTES);
            put_bytes(buf, b);
        }
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn put_fields(buf: &mut Vec<u8>, fields: &FxHashMap<String, ScalarValue>) {
    buf.extend_from_slice(&(fields.len() as u32).to_be_bytes());
    // Deterministic field order keeps payloads byte-stable across encodes
    let mut names: Vec<&String> = fields.keys().collect();
    names.sort();
    for name in names {
        put_bytes(buf, name.as_bytes());
        put_scalar(buf, &fields[name]);
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::internal("row payload truncated"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(i64::from_be_bytes(buf))
    }

    fn f64(&mut self) -> Result<f64> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(f64::from_be_bytes(buf))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw).map_err(|_| Error::internal("row field not utf-8"))
    }

    fn scalar(&mut self) -> Result<ScalarValue> {
        match self.u8()? {
            TAG_BOOL => Ok(ScalarValue::Bool(self.u8()? != 0)),
            TAG_INT => Ok(ScalarValue::Int(self.i64()?)),
            TAG_FLOAT => Ok(ScalarValue::Float(self.f64()?)),
            TAG_TEXT => Ok(ScalarValue::Text(self.string()?)),
            TAG_BYTES => Ok(ScalarValue::Bytes(self.bytes()?)),
            other => Err(Error::internal(format!("unknown scalar tag {}", other))),
        }
    }

    fn fields(&mut self) -> Result<FxHashMap<String, ScalarValue>> {
        let count = self.u32()? as usize;
        let mut fields = FxHashMap::default();
        for _ in 0..count {
            let name = self.string()?;
            fields.insert(name, self.scalar()?);
        }
        Ok(fields)
    }
}

/// Serialize a vector row for the Data CF
pub fn encode_vector_row(row: &VectorWithId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + row.vector.len() * 4);
    buf.extend_from_slice(&row.id.to_be_bytes());
    buf.extend_from_slice(&(row.vector.len() as u32).to_be_bytes());
    for component in &row.vector {
        buf.extend_from_slice(&component.to_be_bytes());
    }
    put_fields(&mut buf, &row.scalar_fields);
    buf
}

pub fn decode_vector_row(data: &[u8]) -> Result<VectorWithId> {
    let mut cur = Cursor::new(data);
    let id = cur.i64()?;
    let dim = cur.u32()? as usize;
    let mut vector = Vec::with_capacity(dim);
    for _ in 0..dim {
        let raw = cur.take(4)?;
        vector.push(f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]));
    }
    let scalar_fields = cur.fields()?;
    Ok(VectorWithId {
        id,
        vector,
        scalar_fields,
    })
}

/// Serialize a document row for the Data CF
pub fn encode_document_row(row: &DocumentWithId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&row.id.to_be_bytes());
    put_fields(&mut buf, &row.fields);
    buf
}

pub fn decode_document_row(data: &[u8]) -> Result<DocumentWithId> {
    let mut cur = Cursor::new(data);
    let id = cur.i64()?;
    let fields = cur.fields()?;
    Ok(DocumentWithId { id, fields })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_row_roundtrip() {
        let row = VectorWithId::new(42, vec![1.0, -0.5, 0.25])
            .with_scalar("label", ScalarValue::Text("news".to_string()))
            .with_scalar("year", ScalarValue::Int(2024));
        let decoded = decode_vector_row(&encode_vector_row(&row)).unwrap();
        assert_eq!(decoded, row);
    }

    #[test]
    fn test_document_row_roundtrip() {
        let row = DocumentWithId::new(7)
            .with_field("title", ScalarValue::Text("storage engines".to_string()))
            .with_field("published", ScalarValue::Bool(true))
            .with_field("score", ScalarValue::Float(0.75));
        let decoded = decode_document_row(&encode_document_row(&row)).unwrap();
        assert_eq!(decoded, row);
    }

    #[test]
    fn test_truncated_payload() {
        let row = VectorWithId::new(1, vec![1.0, 2.0]);
        let bytes = encode_vector_row(&row);
        assert!(decode_vector_row(&bytes[..bytes.len() - 2]).is_err());
    }
}
