//! Record predicates.
//!
//! A [`Filter`] names its field and compares against a scope-free value. Before
//! scanning a block it is bound into a [`BoundFilter`], which resolves string
//! operands to that block's dictionary IDs.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::column::TableColumn;
use crate::record::{FieldId, Record};
use crate::table::info::SavedColumnInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntOp {
    Gt,
    Lt,
    Eq,
    Neq,
}

impl IntOp {
    pub fn test(self, value: i64, operand: i64) -> bool {
        match self {
            IntOp::Gt => value > operand,
            IntOp::Lt => value < operand,
            IntOp::Eq => value == operand,
            IntOp::Neq => value != operand,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrOp {
    Eq,
    Neq,
    Re,
    Nre,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetOp {
    In,
    Nin,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Filter {
    Int {
        name: String,
        field: FieldId,
        op: IntOp,
        value: i64,
    },
    Str {
        name: String,
        field: FieldId,
        op: StrOp,
        value: String,
    },
    Set {
        name: String,
        field: FieldId,
        op: SetOp,
        value: String,
    },
}

impl Filter {
    pub fn name(&self) -> &str {
        match self {
            Filter::Int { name, .. } | Filter::Str { name, .. } | Filter::Set { name, .. } => name,
        }
    }

    pub fn field(&self) -> FieldId {
        match self {
            Filter::Int { field, .. } | Filter::Str { field, .. } | Filter::Set { field, .. } => {
                *field
            }
        }
    }

    fn is_range(&self) -> bool {
        matches!(
            self,
            Filter::Int {
                op: IntOp::Gt | IntOp::Lt,
                ..
            }
        )
    }

    /// Whether every record of a block with these stats could pass, judged
    /// only from the column's min and max.
    pub fn always_true(&self, info: &SavedColumnInfo) -> bool {
        let Filter::Int {
            name, op, value, ..
        } = self
        else {
            return false;
        };
        let Some(stats) = info.int_info.get(name) else {
            return false;
        };
        let full = stats.count as usize == info.num_records;
        match op {
            IntOp::Gt => full && stats.min > *value,
            IntOp::Lt => full && stats.max < *value,
            _ => false,
        }
    }

    /// Zone-map check: false when no record of a block with these stats can
    /// pass. Only range filters are judged; everything else needs the data.
    pub fn may_match(&self, info: &SavedColumnInfo) -> bool {
        if !self.is_range() {
            return true;
        }
        let Filter::Int {
            name, op, value, ..
        } = self
        else {
            return true;
        };
        match info.int_info.get(name) {
            Some(stats) => op.test(stats.min, *value) || op.test(stats.max, *value),
            None => false,
        }
    }
}

/// A filter resolved against one block.
#[derive(Debug, Clone)]
pub enum BoundFilter {
    Int {
        field: FieldId,
        op: IntOp,
        value: i64,
    },
    /// `id` is `None` when the block never saw the string
    StrEq {
        field: FieldId,
        id: Option<i32>,
        negate: bool,
    },
    StrRe {
        field: FieldId,
        re: Regex,
        negate: bool,
    },
    Set {
        field: FieldId,
        id: Option<i32>,
        negate: bool,
    },
}

impl BoundFilter {
    /// `regex` must be the compiled pattern for regex string filters.
    pub fn bind(
        filter: &Filter,
        regex: Option<&Regex>,
        columns: &HashMap<FieldId, TableColumn>,
    ) -> Option<BoundFilter> {
        let lookup = |field: &FieldId, value: &str| columns.get(field).and_then(|c| c.lookup(value));
        let bound = match filter {
            Filter::Int {
                field, op, value, ..
            } => BoundFilter::Int {
                field: *field,
                op: *op,
                value: *value,
            },
            Filter::Str {
                field,
                op: op @ (StrOp::Eq | StrOp::Neq),
                value,
                ..
            } => BoundFilter::StrEq {
                field: *field,
                id: lookup(field, value),
                negate: *op == StrOp::Neq,
            },
            Filter::Str { field, op, .. } => BoundFilter::StrRe {
                field: *field,
                re: regex?.clone(),
                negate: *op == StrOp::Nre,
            },
            Filter::Set {
                field, op, value, ..
            } => BoundFilter::Set {
                field: *field,
                id: lookup(field, value),
                negate: *op == SetOp::Nin,
            },
        };
        Some(bound)
    }

    /// An unpopulated field fails every filter.
    pub fn matches(&self, record: &Record, columns: &mut HashMap<FieldId, TableColumn>) -> bool {
        match self {
            BoundFilter::Int { field, op, value } => {
                record.int(*field).is_some_and(|v| op.test(v, *value))
            }
            BoundFilter::StrEq { field, id, negate } => match record.str_id(*field) {
                Some(v) => (Some(v) == *id) != *negate,
                None => false,
            },
            BoundFilter::StrRe { field, re, negate } => match record.str_id(*field) {
                Some(v) => {
                    let hit = columns
                        .get_mut(field)
                        .is_some_and(|col| col.regex_match(re, v));
                    hit != *negate
                }
                None => false,
            },
            BoundFilter::Set { field, id, negate } => match record.set_ids(*field) {
                Some(members) => id.is_some_and(|id| members.contains(&id)) != *negate,
                None => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::info::IntInfo;

    fn int_filter(op: IntOp, value: i64) -> Filter {
        Filter::Int {
            name: "age".to_string(),
            field: 0,
            op,
            value,
        }
    }

    #[test]
    fn test_int_ops() {
        let mut record = Record::with_fields(1);
        record.set_int(0, 20);
        let mut columns = HashMap::new();

        let cases = [
            (IntOp::Gt, 19, true),
            (IntOp::Gt, 20, false),
            (IntOp::Lt, 21, true),
            (IntOp::Lt, 20, false),
            (IntOp::Eq, 20, true),
            (IntOp::Neq, 20, false),
            (IntOp::Neq, 3, true),
        ];
        for (op, value, expected) in cases {
            let bound = BoundFilter::bind(&int_filter(op, value), None, &columns).unwrap();
            assert_eq!(bound.matches(&record, &mut columns), expected, "{:?} {}", op, value);
        }

        let empty = Record::with_fields(1);
        let neq = BoundFilter::bind(&int_filter(IntOp::Neq, 3), None, &columns).unwrap();
        assert!(!neq.matches(&empty, &mut columns), "Unpopulated fails neq too");
    }

    #[test]
    fn test_str_ops() {
        let mut column = TableColumn::new(10);
        let id = column.value_id("hello");
        let mut columns = HashMap::from([(0, column)]);
        let mut record = Record::with_fields(1);
        record.set_str_id(0, id);

        let str_filter = |op, value: &str| Filter::Str {
            name: "s".to_string(),
            field: 0,
            op,
            value: value.to_string(),
        };
        let re = Regex::new("^hel").unwrap();

        let check = |filter: Filter, columns: &mut HashMap<FieldId, TableColumn>| {
            BoundFilter::bind(&filter, Some(&re), columns)
                .unwrap()
                .matches(&record, columns)
        };
        assert!(check(str_filter(StrOp::Eq, "hello"), &mut columns));
        assert!(!check(str_filter(StrOp::Eq, "absent"), &mut columns));
        assert!(check(str_filter(StrOp::Neq, "absent"), &mut columns));
        assert!(check(str_filter(StrOp::Re, "^hel"), &mut columns));
        assert!(!check(str_filter(StrOp::Nre, "^hel"), &mut columns));
    }

    #[test]
    fn test_set_ops() {
        let mut column = TableColumn::new(10);
        let a = column.value_id("a");
        let b = column.value_id("b");
        let _c = column.value_id("c");
        let mut columns = HashMap::from([(0, column)]);
        let mut record = Record::with_fields(1);
        record.set_set_ids(0, vec![a, b]);

        let set_filter = |op, value: &str| Filter::Set {
            name: "tags".to_string(),
            field: 0,
            op,
            value: value.to_string(),
        };
        for (filter, expected) in [
            (set_filter(SetOp::In, "a"), true),
            (set_filter(SetOp::In, "c"), false),
            (set_filter(SetOp::Nin, "c"), true),
            (set_filter(SetOp::Nin, "b"), false),
            (set_filter(SetOp::Nin, "never"), true),
        ] {
            let bound = BoundFilter::bind(&filter, None, &columns).unwrap();
            assert_eq!(bound.matches(&record, &mut columns), expected, "{:?}", filter);
        }
    }

    #[test]
    fn test_zone_map() {
        let mut stats = IntInfo::new(10);
        stats.update(20);
        let info = SavedColumnInfo {
            num_records: 2,
            int_info: [("age".to_string(), stats)].into_iter().collect(),
            ..Default::default()
        };

        assert!(int_filter(IntOp::Gt, 15).may_match(&info));
        assert!(!int_filter(IntOp::Gt, 20).may_match(&info));
        assert!(int_filter(IntOp::Lt, 11).may_match(&info));
        assert!(!int_filter(IntOp::Lt, 10).may_match(&info));
        assert!(int_filter(IntOp::Eq, 99).may_match(&info), "Only ranges prune");

        assert!(int_filter(IntOp::Gt, 9).always_true(&info));
        assert!(!int_filter(IntOp::Gt, 10).always_true(&info));

        let missing = SavedColumnInfo {
            num_records: 2,
            ..Default::default()
        };
        assert!(!int_filter(IntOp::Gt, 0).may_match(&missing));
    }
}
