//! Fixed-length key encoding for B+-tree entries.
//!
//! Unlike the heap tuple codec (`storage::tuple`), which stores VARCHAR
//! payloads out-of-line, an index key is a byte string of fixed total
//! length `sum(col.len)`: every column, including VARCHAR, reserves its
//! declared maximum width inline so that keys compare with a single
//! column-by-column walk and every key in a node occupies the same
//! number of bytes.

use types::{SqlType, Value};

/// Total encoded length of a key built from `schema`.
pub fn key_len(schema: &[SqlType]) -> usize {
    schema.iter().map(|t| t.declared_len() as usize).sum()
}

/// Encodes `values` into a fixed-width key according to `schema`. Each
/// column is zero-padded (numerics) or space-padded (CHAR/VARCHAR) to
/// its declared width.
pub fn encode(values: &[Value], schema: &[SqlType]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key_len(schema));
    for (value, ty) in values.iter().zip(schema) {
        let width = ty.declared_len() as usize;
        match (value, ty) {
            (Value::Int32(v), SqlType::Int32) => {
                out.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes())
            }
            (Value::Int64(v), SqlType::Int64) => {
                out.extend_from_slice(&((*v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes())
            }
            (Value::Float64(v), SqlType::Float64) => {
                out.extend_from_slice(&v.to_bits().to_be_bytes())
            }
            (Value::Date(v), SqlType::Date) => {
                out.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes())
            }
            (Value::Char(s), SqlType::Char(_)) | (Value::Varchar(s), SqlType::Varchar(_)) => {
                let bytes = s.as_bytes();
                let n = bytes.len().min(width);
                out.extend_from_slice(&bytes[..n]);
                out.resize(out.len() + (width - n), 0);
            }
            _ => out.resize(out.len() + width, 0),
        }
    }
    out
}

/// Decodes a fixed-width key back into typed values.
pub fn decode(key: &[u8], schema: &[SqlType]) -> Vec<Value> {
    let mut cursor = 0;
    let mut values = Vec::with_capacity(schema.len());
    for ty in schema {
        let width = ty.declared_len() as usize;
        let field = &key[cursor..cursor + width];
        cursor += width;
        let value = match ty {
            SqlType::Int32 => {
                let bits = u32::from_be_bytes(field.try_into().unwrap()) ^ 0x8000_0000;
                Value::Int32(bits as i32)
            }
            SqlType::Int64 => {
                let bits = u64::from_be_bytes(field.try_into().unwrap()) ^ 0x8000_0000_0000_0000;
                Value::Int64(bits as i64)
            }
            SqlType::Float64 => {
                Value::Float64(f64::from_bits(u64::from_be_bytes(field.try_into().unwrap())))
            }
            SqlType::Date => {
                let bits = u32::from_be_bytes(field.try_into().unwrap()) ^ 0x8000_0000;
                Value::Date(bits as i32)
            }
            SqlType::Char(_) => {
                let end = field.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                Value::Char(String::from_utf8_lossy(&field[..end]).into_owned())
            }
            SqlType::Varchar(_) => {
                let end = field.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                Value::Varchar(String::from_utf8_lossy(&field[..end]).into_owned())
            }
        };
        values.push(value);
    }
    values
}

/// Compares two encoded keys byte-for-byte. Every numeric field is
/// stored big-endian with its sign bit flipped (two's-complement
/// negatives sort before non-negatives once flipped), so byte-order
/// comparison equals numeric order without needing the schema at
/// compare time; this is also why keys are always re-encoded this way
/// rather than reusing the heap tuple's little-endian inline layout.
pub fn compare(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int32_byte_order_matches_numeric_order() {
        let schema = vec![SqlType::Int32];
        let a = encode(&[Value::Int32(-5)], &schema);
        let b = encode(&[Value::Int32(5)], &schema);
        assert_eq!(compare(&a, &b), std::cmp::Ordering::Less);
    }

    #[test]
    fn round_trips_composite_key() {
        let schema = vec![SqlType::Int32, SqlType::Varchar(8)];
        let values = vec![Value::Int32(42), Value::Varchar("hi".into())];
        let bytes = encode(&values, &schema);
        assert_eq!(bytes.len(), key_len(&schema));
        let back = decode(&bytes, &schema);
        assert_eq!(back, values);
    }

    #[test]
    fn varchar_padding_preserves_order() {
        let schema = vec![SqlType::Varchar(4)];
        let a = encode(&[Value::Varchar("ab".into())], &schema);
        let b = encode(&[Value::Varchar("b".into())], &schema);
        assert_eq!(compare(&a, &b), std::cmp::Ordering::Less);
    }
}
