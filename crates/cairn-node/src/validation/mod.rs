//! # Input Validation Module
//!
//! Validation of repository owners and names as they arrive in API paths
//! and request bodies.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cairn_node::validation::validate_name;
//!
//! if let Err(e) = validate_name("my-repo") {
//!     println!("Invalid name: {}", e);
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use validator::{ValidationError, ValidationErrors};

/// Valid owner and repository names.
/// Must start with alphanumeric, can contain alphanumeric, dots, hyphens, and underscores.
pub static NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]*$").expect("Invalid regex"));

/// Names that collide with routes.
pub static RESERVED_NAMES: &[&str] = &["api", "git", "health", "info"];

/// Maximum length of an owner or repository name.
pub const MAX_NAME_LENGTH: usize = 100;

/// Validation error response.
#[derive(Debug, Serialize)]
pub struct ValidationErrorResponse {
    /// Error type.
    pub error: String,
    /// Human-readable message.
    pub message: String,
    /// Field-level error details.
    pub details: Vec<FieldError>,
}

/// Field-level validation error.
#[derive(Debug, Serialize)]
pub struct FieldError {
    /// Field name.
    pub field: String,
    /// Error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl IntoResponse for ValidationErrorResponse {
    fn into_response(self) -> Response {
        (StatusCode::UNPROCESSABLE_ENTITY, Json(self)).into_response()
    }
}

impl From<ValidationErrors> for ValidationErrorResponse {
    fn from(errors: ValidationErrors) -> Self {
        let mut details: Vec<FieldError> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| FieldError {
                    field: field.to_string(),
                    code: e.code.to_string(),
                    message: e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("Validation failed for field '{}'", field)),
                })
            })
            .collect();
        details.sort_by(|a, b| a.field.cmp(&b.field));

        ValidationErrorResponse {
            error: "validation_error".to_string(),
            message: "Validation failed".to_string(),
            details,
        }
    }
}

/// Validate a repository or owner name.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        let mut err = ValidationError::new("length");
        err.message = Some("Name cannot be empty".into());
        return Err(err);
    }

    if name.len() > MAX_NAME_LENGTH {
        let mut err = ValidationError::new("length");
        err.message = Some(format!("Name must be at most {} characters", MAX_NAME_LENGTH).into());
        return Err(err);
    }

    if !NAME_REGEX.is_match(name) || name.contains("..") || name.ends_with(".git") {
        let mut err = ValidationError::new("pattern");
        err.message = Some(
            "Name must start with a letter or number and contain only letters, numbers, dots, hyphens, and underscores".into()
        );
        return Err(err);
    }

    if RESERVED_NAMES.contains(&name.to_lowercase().as_str()) {
        let mut err = ValidationError::new("reserved");
        err.message = Some("This name is reserved and cannot be used".into());
        return Err(err);
    }

    Ok(())
}

/// Strips the optional `.git` suffix clients append to repository URLs.
pub fn repo_name(segment: &str) -> &str {
    segment.strip_suffix(".git").unwrap_or(segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_validate_name() {
        // Valid names
        assert!(validate_name("demo").is_ok());
        assert!(validate_name("my-repo").is_ok());
        assert!(validate_name("my_repo").is_ok());
        assert!(validate_name("cairn.rs").is_ok());
        assert!(validate_name("a").is_ok());

        // Invalid names
        assert!(validate_name("").is_err());
        assert!(validate_name("-repo").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("my repo").is_err());
        assert!(validate_name("a..b").is_err());
        assert!(validate_name("demo.git").is_err());
        assert!(validate_name("api").is_err()); // reserved
        assert!(validate_name(&"x".repeat(MAX_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_repo_name() {
        assert_eq!(repo_name("demo.git"), "demo");
        assert_eq!(repo_name("demo"), "demo");
    }

    proptest! {
        #[test]
        fn prop_valid_names_accepted(name in "[a-z][a-z0-9_-]{6,40}") {
            prop_assert!(validate_name(&name).is_ok());
        }

        #[test]
        fn prop_slashes_rejected(a in "[a-z]{1,10}", b in "[a-z]{1,10}") {
            let name = format!("{}/{}", a, b);
            prop_assert!(validate_name(&name).is_err());
        }
    }
}
