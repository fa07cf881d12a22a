use regex::Regex;
use std::collections::HashMap;

/// Per-block, per-field string dictionary. IDs are dense, assigned in
/// first-seen order and only meaningful inside the owning block.
#[derive(Debug, Clone, Default)]
pub struct TableColumn {
    ids: HashMap<String, i32>,
    values: Vec<String>,
    regex_cache: RegexCache,
}

impl TableColumn {
    pub fn new(regex_cache_size: usize) -> Self {
        Self {
            ids: HashMap::new(),
            values: Vec::new(),
            regex_cache: RegexCache::new(regex_cache_size),
        }
    }

    /// Intern `value`, returning its ID.
    pub fn value_id(&mut self, value: &str) -> i32 {
        if let Some(id) = self.ids.get(value) {
            return *id;
        }
        let id = self.values.len() as i32;
        self.ids.insert(value.to_string(), id);
        self.values.push(value.to_string());
        id
    }

    /// Look up an ID without interning.
    pub fn lookup(&self, value: &str) -> Option<i32> {
        self.ids.get(value).copied()
    }

    /// Resolve an ID back to its string. Unknown IDs resolve to "".
    pub fn value(&self, id: i32) -> &str {
        if id < 0 {
            return "";
        }
        self.values.get(id as usize).map(String::as_str).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Strings in ID order.
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Test `re` against the string behind `id`, memoizing per pattern.
    pub fn regex_match(&mut self, re: &Regex, id: i32) -> bool {
        if let Some(hit) = self.regex_cache.get(re.as_str(), id) {
            return hit;
        }
        let matched = re.is_match(self.value(id));
        self.regex_cache.insert(re.as_str(), id, matched);
        matched
    }
}

/// Bounded memo of regex results keyed by pattern and string ID. Once full,
/// new results are computed but no longer stored.
#[derive(Debug, Clone, Default)]
struct RegexCache {
    capacity: usize,
    entries: usize,
    by_pattern: HashMap<String, HashMap<i32, bool>>,
}

impl RegexCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: 0,
            by_pattern: HashMap::new(),
        }
    }

    fn get(&self, pattern: &str, id: i32) -> Option<bool> {
        self.by_pattern.get(pattern)?.get(&id).copied()
    }

    fn insert(&mut self, pattern: &str, id: i32, matched: bool) {
        if self.entries >= self.capacity {
            return;
        }
        let slot = match self.by_pattern.get_mut(pattern) {
            Some(slot) => slot,
            None => self.by_pattern.entry(pattern.to_string()).or_default(),
        };
        if slot.insert(id, matched).is_none() {
            self.entries += 1;
        }
    }
}
