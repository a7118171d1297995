//! Recoverable error type
//!
//! Contract violations are not reported through this type; they raise a
//! bug check (see [`crate::ke::bugcheck`]). Errors here are the conditions a
//! caller is expected to handle.

use std::io;
use thiserror::Error;

/// ERROR_NOT_ENOUGH_MEMORY
pub const ERROR_NOT_ENOUGH_MEMORY: u32 = 8;

/// ERROR_ARITHMETIC_OVERFLOW
pub const ERROR_ARITHMETIC_OVERFLOW: u32 = 534;

/// ERROR_INVALID_STATE
pub const ERROR_INVALID_STATE: u32 = 5023;

#[derive(Debug, Error)]
pub enum Error {
    /// The rundown counter has been cancelled; no new acquisitions are accepted.
    #[error("Rundown is running down")]
    RundownActive,

    /// The acquisition would take the counter past its maximum.
    #[error("Rundown counter value overrun")]
    CounterOverflow,

    /// A pool worker thread could not be created.
    #[error("failed to create pool thread: {0}")]
    ThreadCreation(#[source] io::Error),
}

impl Error {
    /// Win32-style status code for this error
    pub fn code(&self) -> u32 {
        match self {
            Error::RundownActive => ERROR_INVALID_STATE,
            Error::CounterOverflow => ERROR_ARITHMETIC_OVERFLOW,
            Error::ThreadCreation(err) => err
                .raw_os_error()
                .map(|code| code as u32)
                .unwrap_or(ERROR_NOT_ENOUGH_MEMORY),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
