//! Identifier definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{define_id, IdError};

define_id!(
    /// One provisioning attempt, from the broker request to the connected node.
    AllocationId,
    "alloc"
);

define_id!(
    /// A live node: a booted VM owned by the controller until it is torn down.
    NodeId,
    "node"
);

/// Maximum length of a template name.
pub const TEMPLATE_ID_MAX_LEN: usize = 64;

/// Operator-chosen template name, e.g. `small` or `linux-fedora`.
///
/// Allowed characters are ASCII alphanumerics, `-`, `_` and `.`. The name is
/// also used as a directory name for the template's clan file, which is why
/// path separators are rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TemplateId(String);

impl TemplateId {
    /// Validates and wraps a template name.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > TEMPLATE_ID_MAX_LEN {
            return Err(IdError::TooLong {
                len: s.len(),
                max: TEMPLATE_ID_MAX_LEN,
            });
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(IdError::InvalidCharacter(c));
        }
        if s == "." || s == ".." {
            return Err(IdError::InvalidCharacter('.'));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TemplateId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for TemplateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for TemplateId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TemplateId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
