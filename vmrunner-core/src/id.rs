use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Default identifier used when the caller does not name the VM.
pub const DEFAULT_VM_ID: &str = "vmrunner-vm";

/// Caller-chosen identifier of a compute system.
///
/// The same string names the VM in the control service registry and is
/// embedded in the serial console pipe name, so it is restricted to
/// characters that are valid in both places.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[non_exhaustive]
pub struct VmId(String);

impl VmId {
    /// Validates and wraps an identifier.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidVmId`] if the identifier is empty, longer
    /// than 200 characters, or contains a path separator, whitespace or a
    /// control character.
    pub fn new(id: impl Into<String>) -> Result<Self, CoreError> {
        let id = id.into();
        let invalid = |reason: &str| CoreError::InvalidVmId {
            id: id.clone(),
            reason: reason.to_owned(),
        };

        if id.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if id.chars().count() > 200 {
            return Err(invalid("must be at most 200 characters"));
        }
        if id.contains(['\\', '/']) {
            return Err(invalid("must not contain path separators"));
        }
        if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid("must not contain whitespace or control characters"));
        }
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the named pipe backing COM port 0 of this VM.
    ///
    /// The pipe is created by the control service once the VM has started,
    /// so opening it may fail for a while after start has been issued.
    #[must_use]
    pub fn console_pipe_name(&self) -> String {
        format!(r"\\.\pipe\{}-console", self.0)
    }
}

impl Default for VmId {
    fn default() -> Self {
        Self(DEFAULT_VM_ID.to_owned())
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VmId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for VmId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for VmId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<VmId> for String {
    fn from(id: VmId) -> Self {
        id.0
    }
}
