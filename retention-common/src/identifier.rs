//! Validated SQL identifiers.
//!
//! Table and column names cannot be passed as bound parameters, so they are
//! interpolated into statement text. [`Identifier`] is the only type the
//! statement builders accept for those positions.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// MySQL's limit on identifier length.
pub const MAX_IDENTIFIER_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier {0:?} is longer than {max} characters", max = MAX_IDENTIFIER_LEN)]
    TooLong(String),
    #[error("identifier {0:?} contains characters outside [A-Za-z0-9_]")]
    InvalidCharacters(String),
}

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"))
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    pub fn parse(name: &str) -> Result<Self, IdentifierError> {
        if name.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if name.len() > MAX_IDENTIFIER_LEN {
            return Err(IdentifierError::TooLong(name.to_owned()));
        }
        if !pattern().is_match(name) {
            return Err(IdentifierError::InvalidCharacters(name.to_owned()));
        }

        Ok(Identifier(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identifier wrapped in back-ticks, ready for interpolation.
    pub fn quoted(&self) -> String {
        format!("`{}`", self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
