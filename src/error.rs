//! Error type shared by the planner, the metadata tree and the proxy.
//!
//! Planner errors record the place in the source where they were raised, so
//! that a failed rewrite can be traced back to the rule that rejected it.

use std::fmt;
use std::panic::Location;

use thiserror::Error;

use crate::adjust::OnionAdjustment;
use crate::enc_set::EncSet;
use crate::onions::{Onion, SecLevel};
use crate::rewrite_plan::Reason;

pub type Result<T> = std::result::Result<T, Error>;

/// File and line of the code that raised an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: &'static str,
    pub line: u32,
}

impl SourceLocation {
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// No onion/level combination satisfies the constraints on `item`.
    #[error(
        "[{location}] {item} cannot be executed under the current encryption scheme; \
         required {required}, available {reason}"
    )]
    NoAvailableEncSet {
        location: SourceLocation,
        item: String,
        required: EncSet,
        reason: Box<Reason>,
    },

    #[error("[{location}] {item} expects {expected} argument(s), got {actual}")]
    BadItemArgumentCount {
        location: SourceLocation,
        item: String,
        expected: usize,
        actual: usize,
    },

    #[error("[{location}] onion {onion} is at {actual}, expected {expected}")]
    UnexpectedSecurityLevel {
        location: SourceLocation,
        onion: Onion,
        expected: SecLevel,
        actual: SecLevel,
    },

    #[error("[{location}] identifier not found: {name}")]
    IdentifierNotFound {
        location: SourceLocation,
        name: String,
    },

    #[error("[{location}] {message}")]
    TextMessage {
        location: SourceLocation,
        message: String,
    },

    /// The metadata tree or store is not in the state the caller assumed.
    #[error("[{location}] metadata inconsistency: {message}")]
    MetadataConsistency {
        location: SourceLocation,
        message: String,
    },

    /// A statement against the live ciphertext tables failed.
    #[error("live schema mutation failed on `{statement}`: {message}")]
    LiveSchemaMutation { statement: String, message: String },

    /// Raised during rewrite when an onion must be peeled before the query
    /// can run. The proxy handles it and retries.
    #[error("onion adjustment required: {0}")]
    OnionAdjust(OnionAdjustment),

    #[error("crypto: {0}")]
    Crypto(String),

    #[error("connection: {0}")]
    Connection(String),

    #[error(transparent)]
    Parser(#[from] sqlparser::parser::ParserError),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    #[track_caller]
    pub fn no_available_enc_set(item: impl Into<String>, required: &EncSet, reason: Reason) -> Self {
        Self::NoAvailableEncSet {
            location: SourceLocation::caller(),
            item: item.into(),
            required: required.clone(),
            reason: Box::new(reason),
        }
    }

    #[track_caller]
    pub fn bad_item_argument_count(item: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::BadItemArgumentCount {
            location: SourceLocation::caller(),
            item: item.into(),
            expected,
            actual,
        }
    }

    #[track_caller]
    pub fn unexpected_security_level(onion: Onion, expected: SecLevel, actual: SecLevel) -> Self {
        Self::UnexpectedSecurityLevel {
            location: SourceLocation::caller(),
            onion,
            expected,
            actual,
        }
    }

    #[track_caller]
    pub fn identifier_not_found(name: impl Into<String>) -> Self {
        Self::IdentifierNotFound {
            location: SourceLocation::caller(),
            name: name.into(),
        }
    }

    #[track_caller]
    pub fn text(message: impl Into<String>) -> Self {
        Self::TextMessage {
            location: SourceLocation::caller(),
            message: message.into(),
        }
    }

    #[track_caller]
    pub fn metadata(message: impl Into<String>) -> Self {
        Self::MetadataConsistency {
            location: SourceLocation::caller(),
            message: message.into(),
        }
    }

    /// Only onion adjustments are worth retrying; every other failure is
    /// final for the query that raised it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OnionAdjust(_))
    }

    pub fn location(&self) -> Option<SourceLocation> {
        match self {
            Self::NoAvailableEncSet { location, .. }
            | Self::BadItemArgumentCount { location, .. }
            | Self::UnexpectedSecurityLevel { location, .. }
            | Self::IdentifierNotFound { location, .. }
            | Self::TextMessage { location, .. }
            | Self::MetadataConsistency { location, .. } => Some(*location),
            _ => None,
        }
    }
}

#[track_caller]
pub fn test_bad_item_argument_count(item: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::bad_item_argument_count(item, expected, actual));
    }
    Ok(())
}

#[track_caller]
pub fn test_unexpected_security_level(onion: Onion, expected: SecLevel, actual: SecLevel) -> Result<()> {
    if expected != actual {
        return Err(Error::unexpected_security_level(onion, expected, actual));
    }
    Ok(())
}

#[track_caller]
pub fn test_identifier_not_found<T>(found: Option<T>, name: &str) -> Result<T> {
    found.ok_or_else(|| Error::identifier_not_found(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_points_at_the_raising_line() {
        let line = line!() + 1;
        let err = Error::text("boom");
        let location = err.location().unwrap();
        assert_eq!(location.line, line);
        assert!(location.file.ends_with("error.rs"));
    }

    #[test]
    fn checked_helpers() {
        assert!(test_bad_item_argument_count("sum", 1, 1).is_ok());
        match test_bad_item_argument_count("sum", 1, 2) {
            Err(Error::BadItemArgumentCount { expected, actual, .. }) => {
                assert_eq!((expected, actual), (1, 2))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(test_unexpected_security_level(Onion::Det, SecLevel::Det, SecLevel::Rnd).is_err());
        assert_eq!(test_identifier_not_found(Some(3), "x").unwrap(), 3);
        assert!(matches!(
            test_identifier_not_found::<u8>(None, "emp"),
            Err(Error::IdentifierNotFound { name, .. }) if name == "emp"
        ));
    }

    #[test]
    fn only_adjustments_are_retryable() {
        assert!(!Error::text("x").is_retryable());
        assert!(!Error::metadata("x").is_retryable());
    }
}
