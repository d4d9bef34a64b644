//! Container name validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{LxcError, LxcResult};

/// A validated LXC container name.
///
/// Container names must:
/// - Be 1-63 characters long
/// - Contain only ASCII letters, digits and hyphens
/// - Start with a letter and not end with a hyphen
///
/// These are the same rules the runtime applies, and they also guarantee a
/// name is a single whitespace-free token in a hosts file line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerName(String);

impl ContainerName {
    /// Maximum length of a container name.
    pub const MAX_LENGTH: usize = 63;

    /// Create a new container name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the name format is invalid.
    pub fn new(name: impl Into<String>) -> LxcResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> LxcResult<()> {
        let invalid = || LxcError::InvalidContainerName {
            name: name.to_string(),
        };

        if name.is_empty() || name.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }

        let mut chars = name.chars();
        if !chars.next().is_some_and(|c| c.is_ascii_alphabetic()) {
            return Err(invalid());
        }
        if name.ends_with('-') {
            return Err(invalid());
        }

        if name.chars().any(|c| !c.is_ascii_alphanumeric() && c != '-') {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerName {
    type Err = LxcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContainerName {
    type Error = LxcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerName> for String {
    fn from(name: ContainerName) -> Self {
        name.0
    }
}

impl AsRef<str> for ContainerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
