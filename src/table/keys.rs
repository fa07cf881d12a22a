use std::collections::HashMap;

use crate::record::{FieldId, FieldType};
use crate::table::info::TableMeta;

/// Table-wide mapping between field names and [`FieldId`]s, plus each
/// field's type. IDs are stable across blocks and only ever appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyTable {
    ids: HashMap<String, FieldId>,
    names: Vec<String>,
    types: Vec<FieldType>,
}

impl KeyTable {
    pub fn from_meta(meta: &TableMeta) -> Self {
        let mut keys = KeyTable::default();
        for (name, id) in &meta.key_table {
            if *id < 0 {
                continue;
            }
            let idx = *id as usize;
            if keys.names.len() <= idx {
                keys.names.resize(idx + 1, String::new());
                keys.types.resize(idx + 1, FieldType::None);
            }
            keys.names[idx] = name.clone();
            keys.types[idx] = meta.key_types.get(id).copied().unwrap_or_default();
            keys.ids.insert(name.clone(), *id);
        }
        keys
    }

    pub fn write_meta(&self, meta: &mut TableMeta) {
        meta.key_table = self.ids.iter().map(|(k, v)| (k.clone(), *v)).collect();
        meta.key_types = self
            .ids
            .values()
            .map(|id| (*id, self.types[*id as usize]))
            .collect();
    }

    pub fn id(&self, name: &str) -> Option<FieldId> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: FieldId) -> Option<&str> {
        if id < 0 {
            return None;
        }
        self.names
            .get(id as usize)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn field_type(&self, id: FieldId) -> FieldType {
        if id < 0 {
            return FieldType::None;
        }
        self.types.get(id as usize).copied().unwrap_or_default()
    }

    /// Slots needed to hold every field in a record.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Look up `name`, assigning the next ID if it is new. Returns `None`
    /// when the field already exists with a different type, or the table
    /// has run out of IDs.
    pub fn get_or_insert(&mut self, name: &str, ty: FieldType) -> Option<FieldId> {
        if let Some(id) = self.ids.get(name) {
            let existing = &mut self.types[*id as usize];
            if *existing == FieldType::None {
                *existing = ty;
            }
            return (*existing == ty).then_some(*id);
        }

        if self.names.len() >= FieldId::MAX as usize {
            return None;
        }
        let id = self.names.len() as FieldId;
        self.ids.insert(name.to_string(), id);
        self.names.push(name.to_string());
        self.types.push(ty);
        Some(id)
    }

    /// `(id, name, type)` for every known field, in ID order.
    pub fn fields(&self) -> impl Iterator<Item = (FieldId, &str, FieldType)> + '_ {
        self.names
            .iter()
            .enumerate()
            .filter(|(_, name)| !name.is_empty())
            .map(|(idx, name)| (idx as FieldId, name.as_str(), self.types[idx]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_and_conflict() {
        let mut keys = KeyTable::default();
        assert_eq!(keys.get_or_insert("age", FieldType::Int), Some(0));
        assert_eq!(keys.get_or_insert("name", FieldType::Str), Some(1));
        assert_eq!(keys.get_or_insert("age", FieldType::Int), Some(0));
        assert_eq!(
            keys.get_or_insert("age", FieldType::Str),
            None,
            "Type conflict must be refused"
        );

        assert_eq!(keys.len(), 2);
        assert_eq!(keys.name(1), Some("name"));
        assert_eq!(keys.field_type(0), FieldType::Int);
        assert_eq!(keys.name(5), None);
    }

    #[test]
    fn test_meta_round_trip() {
        let mut keys = KeyTable::default();
        keys.get_or_insert("a", FieldType::Int);
        keys.get_or_insert("b", FieldType::Set);

        let mut meta = TableMeta::default();
        keys.write_meta(&mut meta);
        assert_eq!(KeyTable::from_meta(&meta), keys);

        let fields: Vec<_> = keys.fields().collect();
        assert_eq!(fields, vec![(0, "a", FieldType::Int), (1, "b", FieldType::Set)]);
    }
}
