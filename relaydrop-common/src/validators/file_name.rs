//! File name validation
//!
//! The receiver writes the incoming file under a name chosen by the sender, so
//! the name must be a single path component.

/// Maximum length for file names in bytes
pub const MAX_FILE_NAME_LENGTH: usize = 255;

/// Validation error for file names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileNameError {
    /// Name is empty
    Empty,
    /// Name exceeds maximum length
    TooLong,
    /// Name contains path separators (/ or \)
    ContainsPathSeparator,
    /// Name is "." or ".."
    ReservedName,
    /// Name contains control characters (including null)
    InvalidCharacters,
}

/// Validate a file name received from a peer
///
/// # Errors
///
/// Returns a `FileNameError` variant describing the validation failure.
pub fn validate_file_name(name: &str) -> Result<(), FileNameError> {
    if name.is_empty() {
        return Err(FileNameError::Empty);
    }

    if name.len() > MAX_FILE_NAME_LENGTH {
        return Err(FileNameError::TooLong);
    }

    if name == "." || name == ".." {
        return Err(FileNameError::ReservedName);
    }

    for ch in name.chars() {
        if ch == '/' || ch == '\\' {
            return Err(FileNameError::ContainsPathSeparator);
        }
        if ch.is_control() {
            return Err(FileNameError::InvalidCharacters);
        }
    }

    Ok(())
}
