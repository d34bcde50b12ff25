//! Error type returned by the ABI encoder.

use serde::ser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The value contains a Rust shape with no Solidity counterpart, such
    /// as a float, a map, or a data-carrying enum. Enums with plain
    /// numeric discriminants can be encoded through `serde_repr`.
    #[error("cannot abi-encode {0}")]
    Unsupported(&'static str),
    /// Raised through [ser::Error::custom], usually by a hand-written
    /// serialize implementation.
    #[error("abi encoding failed: {0}")]
    Custom(String),
}

impl ser::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: core::fmt::Display,
    {
        Error::Custom(msg.to_string())
    }
}

/// Alias for `Result` using the [Error] returned by the encoder.
pub type Result<T> = core::result::Result<T, Error>;
