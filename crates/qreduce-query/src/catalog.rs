use std::collections::BTreeMap;

/// Base relation names and their ordered columns. Lookups ignore ASCII case.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    relations: BTreeMap<String, CatalogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub columns: Vec<String>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, columns: Vec<String>) {
        let name = name.into();
        self.relations
            .insert(name.to_ascii_lowercase(), CatalogEntry { name, columns });
    }

    pub fn with(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.insert(name, columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn lookup(&self, name: &str) -> Option<&CatalogEntry> {
        self.relations.get(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.relations.values().map(|entry| entry.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}
