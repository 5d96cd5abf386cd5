//! Widget list filter options and their normalization.
//!
//! Normalization is deliberately permissive: unknown type strings are
//! dropped instead of rejected, so a filter naming only unknown types
//! behaves like "no type predicate" and returns a broader result than the
//! caller may have intended. Callers that want strict behaviour should use
//! [`FilterOptions::unknown_types`] to detect and reject such input first.

use serde::{Deserialize, Serialize};

use crate::widget_types::WidgetType;

/// Longest search term kept after sanitization (in characters).
pub const MAX_SEARCH_LEN: usize = 200;

/// Raw filter options as supplied by a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
    /// Requested widget types (any of).
    #[serde(default)]
    pub types: Vec<String>,
    /// Restrict to visible or hidden widgets.
    #[serde(default, rename = "isVisible")]
    pub is_visible: Option<bool>,
    /// Case-insensitive substring matched against the widget name.
    #[serde(default)]
    pub search: Option<String>,
}

/// A filter with every component validated and canonicalized.
///
/// Only constructed through [`FilterOptions::normalize`], which guarantees
/// at least one predicate is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFilter {
    /// Distinct known types, in first-seen order.
    pub types: Vec<WidgetType>,
    pub is_visible: Option<bool>,
    /// Lowercased, trimmed, control-character-free search term.
    pub search: Option<String>,
}

impl FilterOptions {
    /// Filter on a set of types only.
    pub fn with_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Canonicalize the filter.
    ///
    /// Returns `None` when no predicate survives normalization; callers must
    /// then take the unfiltered path.
    pub fn normalize(&self) -> Option<NormalizedFilter> {
        let mut types: Vec<WidgetType> = Vec::new();
        for raw in &self.types {
            let lowered = raw.trim().to_lowercase();
            if let Some(t) = WidgetType::from_known(&lowered) {
                if !types.contains(&t) {
                    types.push(t);
                }
            }
        }

        let search = self.search.as_deref().and_then(sanitize_search);

        let filter = NormalizedFilter {
            types,
            is_visible: self.is_visible,
            search,
        };

        if filter.types.is_empty() && filter.is_visible.is_none() && filter.search.is_none() {
            None
        } else {
            Some(filter)
        }
    }

    /// The requested type strings that do not name a known widget type.
    pub fn unknown_types(&self) -> Vec<&str> {
        self.types
            .iter()
            .map(String::as_str)
            .filter(|raw| WidgetType::from_known(&raw.trim().to_lowercase()).is_none())
            .collect()
    }
}

impl NormalizedFilter {
    /// Whether any set-algebra predicate (type or visibility) is present.
    pub fn has_set_predicate(&self) -> bool {
        !self.types.is_empty() || self.is_visible.is_some()
    }

    /// Case-insensitive substring match against a widget name.
    ///
    /// Always true when no search term is set.
    pub fn matches_name(&self, name: &str) -> bool {
        match &self.search {
            Some(term) => name.to_lowercase().contains(term.as_str()),
            None => true,
        }
    }
}

/// Trim, strip NUL and other control characters, lowercase, and cap length.
///
/// Returns `None` if nothing usable remains.
pub fn sanitize_search(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_lowercase()
        .chars()
        .take(MAX_SEARCH_LEN)
        .collect();

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_normalizes_to_none() {
        assert_eq!(FilterOptions::default().normalize(), None);
    }

    #[test]
    fn whitespace_search_is_no_predicate() {
        let f = FilterOptions {
            search: Some("  \0 \t ".into()),
            ..Default::default()
        };
        assert_eq!(f.normalize(), None);
    }

    #[test]
    fn unknown_types_are_dropped_not_rejected() {
        let f = FilterOptions::with_types(["carousel", "nope"]);
        assert_eq!(f.normalize(), None);
        assert_eq!(f.unknown_types(), vec!["carousel", "nope"]);
    }

    #[test]
    fn types_are_lowercased_and_deduplicated() {
        let f = FilterOptions::with_types(["Lead-Form", "lead-form ", "QUIZ", "bogus"]);
        let n = f.normalize().unwrap();
        assert_eq!(n.types, vec![WidgetType::LeadForm, WidgetType::Quiz]);
        assert!(n.has_set_predicate());
    }

    #[test]
    fn visibility_false_is_an_active_predicate() {
        let f = FilterOptions {
            is_visible: Some(false),
            ..Default::default()
        };
        let n = f.normalize().unwrap();
        assert_eq!(n.is_visible, Some(false));
        assert!(n.types.is_empty());
    }

    #[test]
    fn search_strips_control_characters_and_folds_case() {
        assert_eq!(sanitize_search("  Con\0tact\u{7}  "), Some("contact".to_string()));
    }

    #[test]
    fn search_is_capped() {
        let long = "a".repeat(MAX_SEARCH_LEN + 50);
        assert_eq!(sanitize_search(&long).unwrap().len(), MAX_SEARCH_LEN);
    }

    #[test]
    fn matches_name_is_case_insensitive_substring() {
        let f = FilterOptions {
            search: Some("TACT".into()),
            ..Default::default()
        }
        .normalize()
        .unwrap();
        assert!(f.matches_name("Contact Form"));
        assert!(!f.matches_name("Newsletter"));
        assert!(!f.has_set_predicate());
    }

    #[test]
    fn deserializes_camel_case_visibility() {
        let f: FilterOptions =
            serde_json::from_str(r#"{"types":["quiz"],"isVisible":true}"#).unwrap();
        assert_eq!(f.is_visible, Some(true));
        assert_eq!(f.search, None);
    }
}
