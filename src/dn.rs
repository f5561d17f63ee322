//! Distinguished-name micro-parser
//!
//! Splits `Type=id,Type=id,...` strings into ordered pairs. Only the split is
//! done here, there is no evaluation of the pairs.

use crate::error::{FlattenError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinguishedName {
    pairs: Vec<(String, String)>,
}

impl DistinguishedName {
    /// Parse a DN, keeping duplicates and their order
    pub fn parse(dn: &str) -> Result<Self> {
        let dn = dn.trim();
        if dn.is_empty() {
            return Ok(Self { pairs: Vec::new() });
        }

        let mut pairs = Vec::new();
        for segment in dn.split(',') {
            let (type_name, id) =
                segment
                    .split_once('=')
                    .ok_or_else(|| FlattenError::InvalidDistinguishedName {
                        dn: dn.to_string(),
                    })?;
            let type_name = type_name.trim();
            if type_name.is_empty() {
                return Err(FlattenError::InvalidDistinguishedName { dn: dn.to_string() });
            }
            pairs.push((type_name.to_string(), id.trim().to_string()));
        }
        Ok(Self { pairs })
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(type_name, _)| type_name.as_str())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(_, id)| id.as_str())
    }

    /// Type name of the last pair, the class of the object the DN points at
    pub fn leaf_type(&self) -> Option<&str> {
        self.pairs.last().map(|(type_name, _)| type_name.as_str())
    }

    /// Drop every pair before the last occurrence of `type_name`
    ///
    /// The DN is left untouched when the type does not occur.
    pub fn ignore_before(&mut self, type_name: &str) {
        if let Some(index) = self.pairs.iter().rposition(|(t, _)| t == type_name) {
            self.pairs.drain(..index);
        }
    }

    /// Remove the last pair of `type_name` and return its id
    pub fn take(&mut self, type_name: &str) -> Option<String> {
        let index = self.pairs.iter().rposition(|(t, _)| t == type_name)?;
        Some(self.pairs.remove(index).1)
    }
}
