//! Insertion-ordered interning for code-object name tables.

use std::collections::HashMap;

/// Maps names to dense indices in first-seen order.
#[derive(Debug, Default, Clone)]
pub struct NameTable {
    names: Vec<String>,
    lookup: HashMap<String, u32>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the table with names that must keep their positions (parameters).
    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut table = Self::new();
        for name in names {
            table.intern(name.as_ref());
        }
        table
    }

    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.lookup.get(name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.lookup.insert(name.to_string(), id);
        id
    }

    pub fn resolve(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn into_names(self) -> Vec<String> {
        self.names
    }
}
