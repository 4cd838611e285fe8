//! Ordered, case-insensitive header multi-map.
//!
//! Names keep the casing of their first insertion and the order in which
//! they were first seen. A running tally of the wire size
//! (`name: value\r\n` per value) and of the value count is kept in step
//! with every mutation.
//!
//! One map is reused across requests on a connection: [`HeaderMap::clear`]
//! drops the contents but keeps the allocation.

/// Bytes a single header line adds on the wire besides name and value.
const LINE_OVERHEAD: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    name: String,
    values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<Entry>,
    count: usize,
    byte_size: usize,
}

fn line_size(name: &str, value: &str) -> usize {
    name.len() + value.len() + LINE_OVERHEAD
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            count: 0,
            byte_size: 0,
        }
    }

    /// Number of values across all names.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Wire size of the stored headers.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Distinct names the map can hold before reallocating.
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .and_then(|i| self.entries[i].values.first())
            .map(String::as_str)
    }

    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        let values: &'a [String] = match self.position(name) {
            Some(i) => &self.entries[i].values,
            None => &[],
        };
        values.iter().map(String::as_str)
    }

    /// All values under `name` joined with `", "`.
    pub fn get_joined(&self, name: &str) -> Option<String> {
        self.position(name)
            .map(|i| self.entries[i].values.join(", "))
    }

    /// Adds a value, keeping any existing ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        self.byte_size += line_size(&name, &value);
        self.count += 1;
        match self.position(&name) {
            Some(i) => self.entries[i].values.push(value),
            None => self.entries.push(Entry {
                name,
                values: vec![value],
            }),
        }
    }

    /// Replaces every value under `name`, returning the old ones.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<Vec<String>> {
        let name = name.into();
        let previous = self.remove(&name);
        self.append(name, value);
        previous
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        let i = self.position(name)?;
        let entry = self.entries.remove(i);
        for value in &entry.values {
            self.byte_size -= line_size(&entry.name, value);
        }
        self.count -= entry.values.len();
        Some(entry.values)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.count = 0;
        self.byte_size = 0;
    }

    /// `(name, value)` pairs in insertion order, one per value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|e| e.values.iter().map(move |v| (e.name.as_str(), v.as_str())))
    }

    /// Whether any comma-separated element of any `name` value equals
    /// `token`, ignoring ASCII case.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Last comma-separated element across all `name` values.
    pub fn last_token(&self, name: &str) -> Option<&str> {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .last()
    }
}
