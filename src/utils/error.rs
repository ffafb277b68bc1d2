//! Unified error type used across the crate.

use std::fmt;
use std::io;
use std::net;

/// Catch-all error type carrying a human-readable message. Wire-visible
/// failure classification lives in `base::ErrCode`; this type is for local
/// fallible paths only.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ReplicoreError(pub String);

impl ReplicoreError {
    /// Constructs an error from anything string-convertible.
    pub fn msg(m: impl ToString) -> Self {
        ReplicoreError(m.to_string())
    }
}

impl fmt::Display for ReplicoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // no literal quotes around the message
    }
}

impl std::error::Error for ReplicoreError {}

// Transparent conversions from common error types; we only keep the source
// error's string representation.
macro_rules! impl_from_error {
    ($($error:ty),+ $(,)?) => {
        $(impl From<$error> for ReplicoreError {
            fn from(e: $error) -> Self {
                ReplicoreError(e.to_string())
            }
        })+
    };
}

impl_from_error!(
    io::Error,
    net::AddrParseError,
    rmp_serde::encode::Error,
    rmp_serde::decode::Error,
    toml::ser::Error,
    toml::de::Error,
    tokio::sync::oneshot::error::RecvError,
    tokio::sync::mpsc::error::TryRecvError,
);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ReplicoreError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ReplicoreError(e.to_string())
    }
}

impl<T> From<tokio::sync::watch::error::SendError<T>> for ReplicoreError {
    fn from(e: tokio::sync::watch::error::SendError<T>) -> Self {
        ReplicoreError(e.to_string())
    }
}
