//! Catalog of suggested fixes keyed by signature prefix.

use indexmap::IndexMap;

pub const FALLBACK_FIX: &str = "Review manually.";

/// Maps signature prefixes to remediation text. Lookups pick the longest
/// prefix that matches, so `style:line too long` overrides `style`.
#[derive(Debug, Clone, PartialEq)]
pub struct FixCatalog {
    entries: IndexMap<String, String>,
}

impl Default for FixCatalog {
    fn default() -> Self {
        Self::empty()
            .with_fix("complexity", "Split large functions into smaller units and flatten nested branches.")
            .with_fix("maintainability", "Refactor low-maintainability modules into smaller, well-named pieces with tests.")
            .with_fix("length", "Break long files or functions into cohesive parts.")
            .with_fix("comments", "Document public interfaces and non-obvious logic.")
            .with_fix("duplication", "Extract the duplicated code into a shared helper.")
            .with_fix("security", "Validate untrusted input and replace unsafe calls with vetted APIs.")
            .with_fix("style", "Run the project formatter and linter.")
            .with_fix("style:line too long", "Wrap lines at the configured limit or enable automatic formatting.")
    }
}

impl FixCatalog {
    pub fn empty() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    pub fn with_fix(mut self, prefix: impl Into<String>, fix: impl Into<String>) -> Self {
        self.insert(prefix, fix);
        self
    }

    /// Prefixes are stored lowercased to match normalized signatures.
    pub fn insert(&mut self, prefix: impl Into<String>, fix: impl Into<String>) {
        self.entries.insert(prefix.into().to_lowercase(), fix.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fix for the longest matching prefix, if any.
    pub fn lookup(&self, signature: &str) -> Option<&str> {
        self.entries
            .iter()
            .filter(|(prefix, _)| signature.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, fix)| fix.as_str())
    }

    pub fn suggest(&self, signature: &str) -> &str {
        self.lookup(signature).unwrap_or(FALLBACK_FIX)
    }
}
