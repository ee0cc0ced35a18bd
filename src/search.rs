//! Case-insensitive substring filtering for search operations

use crate::error::{StorageError, StorageResult};
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};

/// Matches a single query literal anywhere in a haystack, ignoring case
///
/// Both sides are lowercased with Unicode rules before matching. An empty
/// query matches everything.
#[derive(Debug, Clone)]
pub struct TextFilter {
    automaton: Option<AhoCorasick>,
}

impl TextFilter {
    pub fn new(query: &str) -> StorageResult<Self> {
        if query.is_empty() {
            return Ok(Self { automaton: None });
        }
        let automaton = AhoCorasickBuilder::new()
            .build([query.to_lowercase()])
            .map_err(|e| StorageError::InvalidInput(format!("unusable search query: {}", e)))?;
        Ok(Self {
            automaton: Some(automaton),
        })
    }

    pub fn matches(&self, haystack: &str) -> bool {
        match &self.automaton {
            Some(ac) => ac.is_match(&haystack.to_lowercase()),
            None => true,
        }
    }

    /// Whether any of the given fields match
    pub fn matches_any<'a>(&self, fields: impl IntoIterator<Item = &'a str>) -> bool {
        fields.into_iter().any(|field| self.matches(field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_match() {
        let filter = TextFilter::new("Refund").unwrap();
        assert!(filter.matches("customer asked for a REFUND today"));
        assert!(!filter.matches("customer asked for a discount"));
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let filter = TextFilter::new("").unwrap();
        assert!(filter.matches(""));
        assert!(filter.matches("anything"));
    }

    #[test]
    fn test_matches_any_field() {
        let filter = TextFilter::new("assistant").unwrap();
        assert!(filter.matches_any(["hello", "Assistant"]));
        assert!(!filter.matches_any(["hello", "user"]));
    }

    #[test]
    fn test_non_ascii_case_folding() {
        let filter = TextFilter::new("école").unwrap();
        assert!(filter.matches("ÉCOLE ouverte"));
        assert!(filter.matches("une École"));
        assert!(!filter.matches("ecole"));

        let filter = TextFilter::new("STRASSE").unwrap();
        assert!(filter.matches("hauptstrasse"));
    }
}
