//! Column types and column values shared by every storage-engine crate.
//!
//! A [`Value`] is the in-memory representation of one column of one row. A
//! [`SqlType`] describes the declared shape of a column (its on-disk width,
//! for fixed-width types, or its maximum length for variable-width types).
//! Neither type knows about SQL syntax; they are the data model the record
//! manager, B+-tree and catalog all share.

use std::cmp::Ordering;

/// The declared type of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SqlType {
    Int32,
    Int64,
    Float64,
    /// Fixed-width character column, always stored as exactly `n` bytes.
    Char(u16),
    /// Variable-width character column, up to `n` bytes, stored out-of-line.
    Varchar(u16),
    /// Days since the Unix epoch.
    Date,
}

impl SqlType {
    /// Whether values of this type are stored out-of-line in the tuple
    /// (a 4-byte offset plus a 4-byte length inline) rather than inline.
    pub fn is_variable_width(&self) -> bool {
        matches!(self, SqlType::Varchar(_))
    }

    /// The number of bytes this type occupies inline in a tuple: the full
    /// value for fixed-width types, or `offset(4) + length(4)` for
    /// variable-width types.
    pub fn inline_len(&self) -> usize {
        match self {
            SqlType::Int32 => 4,
            SqlType::Int64 => 8,
            SqlType::Float64 => 8,
            SqlType::Char(n) => *n as usize,
            SqlType::Varchar(_) => 8,
            SqlType::Date => 4,
        }
    }

    /// The maximum length of the type's own payload, used for catalog
    /// bookkeeping and for rejecting overlong strings at insert time.
    pub fn declared_len(&self) -> u16 {
        match self {
            SqlType::Int32 => 4,
            SqlType::Int64 => 8,
            SqlType::Float64 => 8,
            SqlType::Char(n) | SqlType::Varchar(n) => *n,
            SqlType::Date => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SqlType::Int32 => "INT32",
            SqlType::Int64 => "INT64",
            SqlType::Float64 => "FLOAT64",
            SqlType::Char(_) => "CHAR",
            SqlType::Varchar(_) => "VARCHAR",
            SqlType::Date => "DATE",
        }
    }
}

/// A column value: a tagged variant over the column types the engine
/// supports, plus the universal `Null` marker.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Char(String),
    Varchar(String),
    /// Days since the Unix epoch.
    Date(i32),
    Null,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.eq_same_type(other).unwrap_or(false)
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The [`SqlType`] this value's variant corresponds to. `Char`/`Varchar`
    /// report a length equal to the current string's byte length, which is
    /// only useful for display; callers validate against a column's
    /// declared type separately, since a bare `Value` does not know the
    /// declared width.
    pub fn sql_type(&self) -> Option<SqlType> {
        match self {
            Value::Int32(_) => Some(SqlType::Int32),
            Value::Int64(_) => Some(SqlType::Int64),
            Value::Float64(_) => Some(SqlType::Float64),
            Value::Char(s) => Some(SqlType::Char(s.len() as u16)),
            Value::Varchar(s) => Some(SqlType::Varchar(s.len() as u16)),
            Value::Date(_) => Some(SqlType::Date),
            Value::Null => None,
        }
    }

    /// Compares two values of the same underlying type. `Null` compares
    /// equal only to `Null` under `eq_same_type` and has no ordering.
    /// Cross-type comparisons return `None` (callers surface
    /// `DbError::IncompatibleType`).
    pub fn cmp_same_type(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int32(a), Value::Int32(b)) => Some(a.cmp(b)),
            (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
            (Value::Float64(a), Value::Float64(b)) => a.partial_cmp(b),
            // Fixed and variable char columns compare byte-for-byte, matching
            // the original engine's memcmp-based key comparator.
            (Value::Char(a), Value::Char(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (Value::Varchar(a), Value::Varchar(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn eq_same_type(&self, other: &Value) -> Option<bool> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(true),
            (Value::Null, _) | (_, Value::Null) => Some(false),
            _ => self.cmp_same_type(other).map(|o| o == Ordering::Equal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cmp::Ordering::{Equal, Greater, Less};

    #[test]
    fn inline_len_matches_fixed_width_types() {
        assert_eq!(SqlType::Int32.inline_len(), 4);
        assert_eq!(SqlType::Int64.inline_len(), 8);
        assert_eq!(SqlType::Char(16).inline_len(), 16);
        assert_eq!(SqlType::Varchar(255).inline_len(), 8);
        assert!(SqlType::Varchar(255).is_variable_width());
        assert!(!SqlType::Char(16).is_variable_width());
    }

    #[test]
    fn comparisons_require_same_type() {
        assert_eq!(Value::Int32(1).cmp_same_type(&Value::Int32(2)), Some(Less));
        assert_eq!(
            Value::Varchar("a".into()).cmp_same_type(&Value::Varchar("a".into())),
            Some(Equal)
        );
        assert_eq!(
            Value::Int64(3).cmp_same_type(&Value::Int64(2)),
            Some(Greater)
        );
        assert_eq!(
            Value::Int32(1).cmp_same_type(&Value::Varchar("1".into())),
            None
        );
    }

    #[test]
    fn null_equality_is_special_cased() {
        assert_eq!(Value::Null.eq_same_type(&Value::Null), Some(true));
        assert_eq!(Value::Null.eq_same_type(&Value::Int32(0)), Some(false));
        assert_eq!(Value::Null.cmp_same_type(&Value::Int32(0)), None);
    }

    #[test]
    fn serde_round_trip_stability() {
        let vals = vec![
            Value::Int32(-42),
            Value::Int64(7),
            Value::Float64(1.5),
            Value::Varchar("Ada".into()),
            Value::Date(19000),
            Value::Null,
        ];
        let json = serde_json::to_string(&vals).unwrap();
        let back: Vec<Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(vals, back);
    }

    proptest! {
        #[test]
        fn order_is_antisymmetric(i in any::<i64>(), j in any::<i64>()) {
            let a = Value::Int64(i);
            let b = Value::Int64(j);
            match (a.cmp_same_type(&b), b.cmp_same_type(&a)) {
                (Some(o1), Some(o2)) => prop_assert_eq!(o1, o2.reverse()),
                _ => prop_assert!(false, "same-type comparison must always succeed"),
            }
        }

        #[test]
        fn text_cmp_matches_byte_order(a in ".*", b in ".*") {
            let va = Value::Varchar(a.clone());
            let vb = Value::Varchar(b.clone());
            prop_assert_eq!(va.cmp_same_type(&vb), Some(a.as_bytes().cmp(b.as_bytes())));
        }
    }
}
