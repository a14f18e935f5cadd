//! Migration version numbers
//!
//! Versions are dotted triples (`MAJOR.MINOR.PATCH`) compared numerically
//! component by component, so `1.10.0` sorts after `1.9.0`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MigrationError;

/// A totally ordered migration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl MigrationVersion {
    /// The version below every registrable migration
    pub const ZERO: Self = Self::new(0, 0, 0);

    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a version string, rejecting anything that is not exactly three
    /// non-empty decimal components. Surrounding whitespace is rejected too.
    pub fn parse(raw: &str) -> Result<Self, MigrationError> {
        let mut parts = raw.split('.');
        let mut next = || -> Result<u64, MigrationError> {
            let part = parts
                .next()
                .ok_or_else(|| MigrationError::invalid_version(raw))?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(MigrationError::invalid_version(raw));
            }
            part.parse::<u64>()
                .map_err(|_| MigrationError::invalid_version(raw))
        };

        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(MigrationError::invalid_version(raw));
        }
        Ok(version)
    }
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for MigrationVersion {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MigrationVersion {
    type Error = MigrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for MigrationVersion {
    type Error = MigrationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<MigrationVersion> for String {
    fn from(version: MigrationVersion) -> Self {
        version.to_string()
    }
}
