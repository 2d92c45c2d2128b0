// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur in the database
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// File does not carry a valid format signature
    Format(String),

    /// On-disk contents fail internal consistency checks
    ///
    /// This covers wrong block signatures, broken leaf chains and
    /// out-of-range block pointers.
    Corruption(String),

    /// Caller-supplied argument is invalid (e.g. wrong key length)
    InvalidArgument(String),

    /// Operation is not valid in the current database state
    InvalidState(&'static str),

    /// Asset path does not exist in a packed archive
    NotFound(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BTreeDbError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Database result
pub type Result<T> = std::result::Result<T, Error>;
