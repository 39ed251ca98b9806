//! Tuple encoding: turns a row of [`types::Value`] into the serialized
//! byte format a slotted page stores, and back. A tuple's schema is never
//! stored alongside it; callers always supply the owning table's column
//! types.

use common::{DbError, DbResult};
use types::{SqlType, Value};

fn null_bitmap_len(ncols: usize) -> usize {
    ncols.div_ceil(8)
}

/// Serializes `values` according to `schema` into the on-disk tuple
/// format: a 4-byte total length, a null bitmap, a fixed-width section
/// (inlining fixed columns and `(offset, len)` pairs for variable-width
/// ones), and a variable-width section holding the actual string bytes.
pub fn encode(values: &[Value], schema: &[SqlType]) -> DbResult<Vec<u8>> {
    if values.len() != schema.len() {
        return Err(DbError::InvalidValueCount {
            expected: schema.len(),
            actual: values.len(),
        });
    }

    let bitmap_len = null_bitmap_len(schema.len());
    let fixed_len: usize = schema.iter().map(|t| t.inline_len()).sum();

    let mut bitmap = vec![0u8; bitmap_len];
    let mut fixed = Vec::with_capacity(fixed_len);
    let mut variable = Vec::new();

    for (i, (value, ty)) in values.iter().zip(schema.iter()).enumerate() {
        if value.is_null() {
            bitmap[i / 8] |= 1 << (i % 8);
            fixed.resize(fixed.len() + ty.inline_len(), 0);
            continue;
        }
        match (value, ty) {
            (Value::Int32(v), SqlType::Int32) => fixed.extend_from_slice(&v.to_le_bytes()),
            (Value::Int64(v), SqlType::Int64) => fixed.extend_from_slice(&v.to_le_bytes()),
            (Value::Float64(v), SqlType::Float64) => {
                fixed.extend_from_slice(&v.to_bits().to_le_bytes())
            }
            (Value::Date(v), SqlType::Date) => fixed.extend_from_slice(&v.to_le_bytes()),
            (Value::Char(s), SqlType::Char(n)) => {
                let bytes = s.as_bytes();
                if bytes.len() > *n as usize {
                    return Err(DbError::StringOverflow(format!(
                        "CHAR({n}) overflowed by {}",
                        bytes.len() - *n as usize
                    )));
                }
                let mut padded = vec![0u8; *n as usize];
                padded[..bytes.len()].copy_from_slice(bytes);
                fixed.extend_from_slice(&padded);
            }
            (Value::Varchar(s), SqlType::Varchar(max)) => {
                let bytes = s.as_bytes();
                if bytes.len() > *max as usize {
                    return Err(DbError::StringOverflow(format!(
                        "VARCHAR({max}) overflowed by {}",
                        bytes.len() - *max as usize
                    )));
                }
                let offset = (4 + bitmap_len + fixed_len + variable.len()) as u32;
                fixed.extend_from_slice(&offset.to_le_bytes());
                fixed.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                variable.extend_from_slice(bytes);
            }
            (other, ty) => {
                return Err(DbError::IncompatibleType {
                    lhs: format!("{other:?}"),
                    rhs: ty.name().to_string(),
                });
            }
        }
    }

    let total_len = 4 + bitmap_len + fixed.len() + variable.len();
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&(total_len as u32).to_le_bytes());
    out.extend_from_slice(&bitmap);
    out.extend_from_slice(&fixed);
    out.extend_from_slice(&variable);
    Ok(out)
}

/// Reconstructs a row of [`Value`]s from the serialized tuple bytes.
pub fn decode(tuple: &[u8], schema: &[SqlType]) -> DbResult<Vec<Value>> {
    let total_len = u32::from_le_bytes(tuple[0..4].try_into().unwrap()) as usize;
    if total_len != tuple.len() {
        return Err(DbError::InvalidRecordSize {
            expected: total_len,
            actual: tuple.len(),
        });
    }

    let bitmap_len = null_bitmap_len(schema.len());
    let bitmap = &tuple[4..4 + bitmap_len];
    let mut cursor = 4 + bitmap_len;

    let mut values = Vec::with_capacity(schema.len());
    for (i, ty) in schema.iter().enumerate() {
        let is_null = bitmap[i / 8] & (1 << (i % 8)) != 0;
        let field = &tuple[cursor..cursor + ty.inline_len()];
        cursor += ty.inline_len();

        if is_null {
            values.push(Value::Null);
            continue;
        }

        let value = match ty {
            SqlType::Int32 => Value::Int32(i32::from_le_bytes(field.try_into().unwrap())),
            SqlType::Int64 => Value::Int64(i64::from_le_bytes(field.try_into().unwrap())),
            SqlType::Float64 => Value::Float64(f64::from_bits(u64::from_le_bytes(
                field.try_into().unwrap(),
            ))),
            SqlType::Date => Value::Date(i32::from_le_bytes(field.try_into().unwrap())),
            SqlType::Char(_) => {
                let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
                Value::Char(String::from_utf8_lossy(&field[..end]).into_owned())
            }
            SqlType::Varchar(_) => {
                let offset = u32::from_le_bytes(field[0..4].try_into().unwrap()) as usize;
                let len = u32::from_le_bytes(field[4..8].try_into().unwrap()) as usize;
                let bytes = &tuple[offset..offset + len];
                Value::Varchar(String::from_utf8_lossy(bytes).into_owned())
            }
        };
        values.push(value);
    }
    Ok(values)
}

/// Projects a subset of columns (by index into `schema`) into a freshly
/// encoded tuple using `key_schema`, for building index keys out of a
/// heap tuple (the Record Manager's `GetKeyTuple`).
pub fn project(
    tuple: &[u8],
    schema: &[SqlType],
    key_attrs: &[usize],
    key_schema: &[SqlType],
) -> DbResult<Vec<u8>> {
    let values = decode(tuple, schema)?;
    let projected: Vec<Value> = key_attrs.iter().map(|&i| values[i].clone()).collect();
    encode(&projected, key_schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Vec<SqlType> {
        vec![SqlType::Int32, SqlType::Varchar(16), SqlType::Float64]
    }

    #[test]
    fn round_trips_non_null_values() {
        let values = vec![
            Value::Int32(7),
            Value::Varchar("hello".into()),
            Value::Float64(2.5),
        ];
        let schema = schema();
        let bytes = encode(&values, &schema).unwrap();
        let back = decode(&bytes, &schema).unwrap();
        assert_eq!(values, back);
    }

    #[test]
    fn round_trips_null_values() {
        let values = vec![Value::Null, Value::Null, Value::Float64(1.0)];
        let schema = schema();
        let bytes = encode(&values, &schema).unwrap();
        let back = decode(&bytes, &schema).unwrap();
        assert_eq!(back[0], Value::Null);
        assert_eq!(back[1], Value::Null);
        assert_eq!(back[2], Value::Float64(1.0));
    }

    #[test]
    fn rejects_overlong_varchar() {
        let values = vec![
            Value::Int32(1),
            Value::Varchar("x".repeat(100)),
            Value::Float64(0.0),
        ];
        let err = encode(&values, &schema()).unwrap_err();
        assert!(matches!(err, DbError::StringOverflow(_)));
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let values = vec![Value::Int32(1)];
        let err = encode(&values, &schema()).unwrap_err();
        assert!(matches!(err, DbError::InvalidValueCount { .. }));
    }

    #[test]
    fn project_extracts_key_columns() {
        let schema = schema();
        let values = vec![
            Value::Int32(42),
            Value::Varchar("key".into()),
            Value::Float64(9.0),
        ];
        let tuple = encode(&values, &schema).unwrap();
        let key_schema = vec![SqlType::Int32];
        let key = project(&tuple, &schema, &[0], &key_schema).unwrap();
        let decoded = decode(&key, &key_schema).unwrap();
        assert_eq!(decoded, vec![Value::Int32(42)]);
    }
}
