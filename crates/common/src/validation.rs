//! Input validation shared by the write and read paths.

use crate::{HomecareError, Result};

/// Maximum memory content length, in characters.
pub const MAX_CONTENT_CHARS: usize = 2000;

pub fn validate_patient_id(patient_id: &str) -> Result<()> {
    if patient_id.trim().is_empty() {
        return Err(HomecareError::Validation(
            "patient_id must not be empty".into(),
        ));
    }
    Ok(())
}

/// Content must be 1..=2000 characters once trimmed, the form it is
/// stored in.
pub fn validate_content(content: &str) -> Result<()> {
    let content = content.trim();
    if content.is_empty() {
        return Err(HomecareError::Validation("content must not be empty".into()));
    }
    let len = content.chars().count();
    if len > MAX_CONTENT_CHARS {
        return Err(HomecareError::Validation(format!(
            "content is {len} characters, maximum is {MAX_CONTENT_CHARS}"
        )));
    }
    Ok(())
}

/// Content that can never become a useful memory.
pub fn is_degenerate(content: &str) -> bool {
    validate_content(content).is_err() || !content.chars().any(char::is_alphanumeric)
}
