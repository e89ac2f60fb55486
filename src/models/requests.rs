//! Request DTOs for the operational HTTP surface
//!
//! Change events are accepted as [`crate::events::ChangeEvent`] directly.

use serde::Deserialize;

use crate::cache::{KeyPattern, MAX_KEY_LENGTH};

/// Request body for a manual invalidation (POST /invalidate)
///
/// # Fields
/// - `patterns`: Exact keys, raw prefixes (`prefix*`) or families (`base:*`)
#[derive(Debug, Clone, Deserialize)]
pub struct InvalidateRequest {
    pub patterns: Vec<String>,
}

impl InvalidateRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.patterns.is_empty() {
            return Some("At least one pattern is required".to_string());
        }
        if self.patterns.iter().any(|p| p.is_empty()) {
            return Some("Patterns cannot be empty".to_string());
        }
        if self.patterns.iter().any(|p| p.len() > MAX_KEY_LENGTH) {
            return Some(format!(
                "Pattern exceeds maximum length of {} characters",
                MAX_KEY_LENGTH
            ));
        }
        None
    }

    pub fn into_patterns(self) -> Vec<KeyPattern> {
        self.patterns.into_iter().map(KeyPattern::new).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidate_request_deserialize() {
        let json = r#"{"patterns": ["cat:list:*", "v1:cat:detail:ab"]}"#;
        let req: InvalidateRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.patterns.len(), 2);
        assert!(req.validate().is_none());
        assert_eq!(req.into_patterns()[0].as_str(), "cat:list:*");
    }

    #[test]
    fn test_validate_empty_patterns() {
        let req = InvalidateRequest { patterns: vec![] };
        assert!(req.validate().is_some());

        let req = InvalidateRequest {
            patterns: vec!["".to_string()],
        };
        assert!(req.validate().is_some());
    }

    #[test]
    fn test_validate_long_pattern() {
        let req = InvalidateRequest {
            patterns: vec!["a".repeat(MAX_KEY_LENGTH + 1)],
        };
        assert!(req.validate().is_some());
    }
}
