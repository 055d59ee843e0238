use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

// Same loose rule as the web forms: something@something.something
static EMAIL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\S+@\S+\.\S+$").expect("Failed to compile email regex"));

/// A form field that failed validation. Reported before any write happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    Required(&'static str),

    #[error("Invalid email address for {field}: {value:?}")]
    InvalidEmail { field: &'static str, value: String },

    #[error("{0} must be greater than 0")]
    NotPositive(&'static str),

    #[error("Id {0} is already in use")]
    DuplicateId(String),
}

/// Checks that a text field is not empty once trimmed
pub fn require_text(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::Required(field))
    } else {
        Ok(())
    }
}

/// Required email field
pub fn require_email(value: &str, field: &'static str) -> Result<(), ValidationError> {
    require_text(value, field)?;
    optional_email(value, field)
}

/// Email field that may be left empty
pub fn optional_email(value: &str, field: &'static str) -> Result<(), ValidationError> {
    let value = value.trim();
    if value.is_empty() || EMAIL_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidEmail {
            field,
            value: value.to_owned(),
        })
    }
}

/// Amounts must be finite and strictly positive
pub fn require_positive(value: f64, field: &'static str) -> Result<(), ValidationError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::NotPositive(field))
    }
}
