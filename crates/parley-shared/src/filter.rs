//! Sensitive-term masking.
//!
//! Content is filtered once, before it is stored or delivered. There is no
//! way back to the original text.

use crate::constants::MASK_CHAR;

/// Replaces every configured term with a mask of the same character length.
#[derive(Debug, Clone, Default)]
pub struct ContentFilter {
    terms: Vec<String>,
}

impl ContentFilter {
    /// Build a filter. Empty terms are dropped.
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let terms = terms
            .into_iter()
            .map(Into::into)
            .filter(|t: &String| !t.is_empty())
            .collect();
        Self { terms }
    }

    /// Parse a comma-separated list, trimming whitespace around each term.
    pub fn from_csv(list: &str) -> Self {
        Self::new(list.split(',').map(str::trim))
    }

    /// Terms are applied in configuration order, each over the output of the
    /// previous one.
    pub fn apply(&self, content: &str) -> String {
        let mut out = content.to_string();
        for term in &self.terms {
            if out.contains(term.as_str()) {
                let mask: String = std::iter::repeat(MASK_CHAR)
                    .take(term.chars().count())
                    .collect();
                out = out.replace(term.as_str(), &mask);
            }
        }
        out
    }
}
