use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// File-level attributes collected from header, footer and configuration
/// elements
///
/// Keys are local names. Namespace declarations are kept apart, under their
/// full `xmlns` / `xmlns:prefix` name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub attributes: IndexMap<String, String>,
    pub namespaces: IndexMap<String, String>,
}

impl FileMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the attributes of one element, later values win
    pub fn merge(&mut self, attributes: &[(String, String)]) {
        for (key, value) in attributes {
            self.insert(key.clone(), value.clone());
        }
    }

    pub fn insert(&mut self, key: String, value: String) {
        if key == "xmlns" || key.starts_with("xmlns:") {
            self.namespaces.insert(key, value);
        } else {
            self.attributes.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.namespaces.is_empty()
    }
}
