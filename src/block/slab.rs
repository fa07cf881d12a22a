use parking_lot::Mutex;
use std::collections::HashMap;

use crate::record::Record;

/// Free list of record arrays keyed by `(records, fields)`, so a scan over
/// many full blocks reuses the same few allocations.
#[derive(Debug, Default)]
pub struct RecordPool {
    free: Mutex<HashMap<(usize, usize), Vec<Vec<Record>>>>,
    max_per_shape: usize,
}

impl RecordPool {
    pub fn new(max_per_shape: usize) -> Self {
        Self {
            free: Mutex::new(HashMap::new()),
            max_per_shape,
        }
    }

    /// Hand out `records` cleared records with `fields` slots each.
    pub fn checkout(&self, records: usize, fields: usize) -> Vec<Record> {
        let recycled = self
            .free
            .lock()
            .get_mut(&(records, fields))
            .and_then(Vec::pop);

        match recycled {
            Some(mut slab) => {
                slab.iter_mut().for_each(Record::clear);
                slab
            }
            None => (0..records).map(|_| Record::with_fields(fields)).collect(),
        }
    }

    /// Return a slab for reuse. Dropped when that shape's list is full.
    pub fn give_back(&self, slab: Vec<Record>) {
        let Some(first) = slab.first() else {
            return;
        };
        let shape = (slab.len(), first.field_count());
        if slab.iter().any(|r| r.field_count() != shape.1) {
            return;
        }

        let mut free = self.free.lock();
        let list = free.entry(shape).or_default();
        if list.len() < self.max_per_shape {
            list.push(slab);
        }
    }

    pub fn available(&self, records: usize, fields: usize) -> usize {
        self.free
            .lock()
            .get(&(records, fields))
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldType;

    #[test]
    fn test_reuse_by_shape() {
        let pool = RecordPool::new(2);
        let mut slab = pool.checkout(4, 3);
        assert_eq!(slab.len(), 4);
        slab[0].set_int(1, 9);

        pool.give_back(slab);
        assert_eq!(pool.available(4, 3), 1);
        assert_eq!(pool.available(4, 2), 0);

        let reused = pool.checkout(4, 3);
        assert_eq!(pool.available(4, 3), 0);
        assert_eq!(
            reused[0].field_type(1),
            FieldType::None,
            "Recycled records come back cleared"
        );
    }

    #[test]
    fn test_bounded_per_shape() {
        let pool = RecordPool::new(1);
        pool.give_back(pool.checkout(2, 2));
        pool.give_back(pool.checkout(2, 2));
        pool.give_back((0..2).map(|_| Record::with_fields(2)).collect());
        assert_eq!(pool.available(2, 2), 1);
    }
}
