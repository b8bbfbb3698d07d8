//! Primitive types and newtypes for type-safe API interactions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A caller-supplied key identifying one command inside a batch.
///
/// Keys are opaque to the client. They are never generated by the batch
/// orchestrator and are the only link between a command and its result.
///
/// # Example
///
/// ```
/// use bitrix24_rs::CommandKey;
///
/// let key = CommandKey::new("deal_42");
/// assert_eq!(key.as_str(), "deal_42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandKey(String);

impl CommandKey {
    /// Create a new command key.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CommandKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for CommandKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommandKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<usize> for CommandKey {
    fn from(index: usize) -> Self {
        Self(index.to_string())
    }
}

/// A REST method name such as `crm.deal.list`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodName(String);

impl MethodName {
    /// Create a method name, rejecting empty names and names that would
    /// break the `<method>.json` URL.
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::Validation("Method name is empty".to_string()));
        }
        if trimmed
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#' | '&'))
        {
            return Err(crate::Error::Validation(format!(
                "Invalid method name: {}",
                name
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The distinguished `batch` method.
    pub(crate) fn batch() -> Self {
        Self("batch".to_string())
    }

    /// Get the method name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for the distinguished `batch` method.
    pub fn is_batch(&self) -> bool {
        self.0.eq_ignore_ascii_case("batch")
    }
}

impl fmt::Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for MethodName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
