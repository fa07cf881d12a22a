//! Row representation.
//!
//! A [`Record`] is the block-local form: parallel arrays indexed by field ID,
//! where string and set values are IDs into the owning block's
//! [`TableColumn`](crate::column::TableColumn) dictionaries. Those IDs mean
//! nothing outside that block. A [`Row`] is the scope-free form used by the
//! ingest log and by retained samples: field names and resolved values.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Table-wide field identifier, assigned by the table's key table.
pub type FieldId = i16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FieldType {
    #[default]
    None,
    Int,
    Str,
    Set,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::None => "none",
            FieldType::Int => "int",
            FieldType::Str => "str",
            FieldType::Set => "set",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub ints: Vec<i64>,
    pub strs: Vec<i32>,
    pub sets: HashMap<FieldId, Vec<i32>>,
    pub populated: Vec<FieldType>,
}

impl Record {
    pub fn with_fields(fields: usize) -> Self {
        let mut record = Record::default();
        record.resize_fields(fields);
        record
    }

    /// Grow the field arrays so `fields` slots exist. Never shrinks.
    pub fn resize_fields(&mut self, fields: usize) {
        if self.populated.len() >= fields {
            return;
        }
        self.ints.resize(fields, 0);
        self.strs.resize(fields, 0);
        self.populated.resize(fields, FieldType::None);
    }

    pub fn field_count(&self) -> usize {
        self.populated.len()
    }

    /// Mark every slot unpopulated, keeping the allocations.
    pub fn clear(&mut self) {
        self.populated.iter_mut().for_each(|p| *p = FieldType::None);
        self.sets.clear();
    }

    pub fn field_type(&self, field: FieldId) -> FieldType {
        if field < 0 {
            return FieldType::None;
        }
        self.populated
            .get(field as usize)
            .copied()
            .unwrap_or(FieldType::None)
    }

    pub fn int(&self, field: FieldId) -> Option<i64> {
        match self.field_type(field) {
            FieldType::Int => Some(self.ints[field as usize]),
            _ => None,
        }
    }

    pub fn str_id(&self, field: FieldId) -> Option<i32> {
        match self.field_type(field) {
            FieldType::Str => Some(self.strs[field as usize]),
            _ => None,
        }
    }

    pub fn set_ids(&self, field: FieldId) -> Option<&[i32]> {
        match self.field_type(field) {
            FieldType::Set => self.sets.get(&field).map(|v| v.as_slice()),
            _ => None,
        }
    }

    pub fn set_int(&mut self, field: FieldId, value: i64) {
        let idx = field as usize;
        self.resize_fields(idx + 1);
        self.ints[idx] = value;
        self.populated[idx] = FieldType::Int;
    }

    pub fn set_str_id(&mut self, field: FieldId, value: i32) {
        let idx = field as usize;
        self.resize_fields(idx + 1);
        self.strs[idx] = value;
        self.populated[idx] = FieldType::Str;
    }

    pub fn push_set_id(&mut self, field: FieldId, value: i32) {
        let idx = field as usize;
        self.resize_fields(idx + 1);
        self.sets.entry(field).or_default().push(value);
        self.populated[idx] = FieldType::Set;
    }

    pub fn set_set_ids(&mut self, field: FieldId, values: Vec<i32>) {
        let idx = field as usize;
        self.resize_fields(idx + 1);
        self.sets.insert(field, values);
        self.populated[idx] = FieldType::Set;
    }
}

/// A resolved value, independent of any block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Str(String),
    Set(Vec<String>),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Int(_) => FieldType::Int,
            Value::Str(_) => FieldType::Str,
            Value::Set(_) => FieldType::Set,
        }
    }
}

/// A scope-free record keyed by field name. This is what callers ingest,
/// what the row-store log persists and what sampling queries return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub fields: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn int(mut self, name: impl Into<String>, value: i64) -> Self {
        self.fields.push((name.into(), Value::Int(value)));
        self
    }

    pub fn str(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), Value::Str(value.into())));
        self
    }

    /// Empty sets are dropped: a set field with no members is unpopulated.
    pub fn set<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members: Vec<String> = values.into_iter().map(Into::into).collect();
        if !members.is_empty() {
            self.fields.push((name.into(), Value::Set(members)));
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_populated_accessors() {
        let mut record = Record::with_fields(2);
        assert_eq!(record.field_type(0), FieldType::None);
        assert_eq!(record.int(0), None);

        record.set_int(0, 42);
        record.set_str_id(1, 3);
        record.push_set_id(4, 1);
        record.push_set_id(4, 2);

        assert_eq!(record.field_count(), 5);
        assert_eq!(record.int(0), Some(42));
        assert_eq!(record.str_id(1), Some(3));
        assert_eq!(record.int(1), None, "Str slot must not read as int");
        assert_eq!(record.set_ids(4), Some(&[1, 2][..]));
        assert_eq!(record.field_type(3), FieldType::None);
        assert_eq!(record.field_type(-1), FieldType::None);
        assert_eq!(record.field_type(100), FieldType::None);
    }

    #[test]
    fn test_clear_keeps_shape() {
        let mut record = Record::with_fields(3);
        record.set_int(2, 7);
        record.push_set_id(1, 9);
        record.clear();

        assert_eq!(record.field_count(), 3);
        assert!(record.populated.iter().all(|p| *p == FieldType::None));
        assert!(record.sets.is_empty());
    }

    #[test]
    fn test_row_builder() {
        let row = Row::new()
            .int("age", 10)
            .str("name", "bob")
            .set("tags", ["a", "b"])
            .set("empty", Vec::<String>::new());

        assert_eq!(row.fields.len(), 3);
        assert_eq!(row.get("age"), Some(&Value::Int(10)));
        assert_eq!(row.get("name").map(Value::field_type), Some(FieldType::Str));
        assert_eq!(row.get("empty"), None);
    }
}
