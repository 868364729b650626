//! Input validation functions
//!
//! Shared between client and server: clients validate before sending, the
//! relay and receiving clients validate what they are sent.

mod file_name;
mod transfer_code;

pub use file_name::{FileNameError, MAX_FILE_NAME_LENGTH, validate_file_name};
pub use transfer_code::{
    TRANSFER_CODE_LENGTH, TransferCodeError, generate_transfer_code, validate_transfer_code,
};
