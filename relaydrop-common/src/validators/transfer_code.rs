//! Transfer code validation and generation
//!
//! A transfer code is the only thing two endpoints share before they meet at a
//! relay, so both sides validate it before it goes on the wire.

/// Number of digits in a transfer code
pub const TRANSFER_CODE_LENGTH: usize = 6;

/// Validation error for transfer codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferCodeError {
    /// Code is not exactly six characters
    InvalidLength,
    /// Code contains something other than ASCII digits
    InvalidCharacters,
}

/// Validate a transfer code
///
/// Checks:
/// - Exactly 6 characters long
/// - Only ASCII digits (0-9)
///
/// # Errors
///
/// Returns a `TransferCodeError` variant describing the validation failure.
pub fn validate_transfer_code(code: &str) -> Result<(), TransferCodeError> {
    if code.len() != TRANSFER_CODE_LENGTH {
        return Err(TransferCodeError::InvalidLength);
    }

    if !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TransferCodeError::InvalidCharacters);
    }

    Ok(())
}

/// Generate a random six-digit transfer code (leading zeros allowed)
pub fn generate_transfer_code() -> String {
    let value: u32 = rand::random_range(0..1_000_000);
    format!("{value:06}")
}
