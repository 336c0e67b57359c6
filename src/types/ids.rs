//! Strongly-typed identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one build run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(Uuid);

impl BuildId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Shared secret every topic call to one engine process must carry.
///
/// Minted per launch. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionSecret(String);

impl SessionSecret {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Use a secret handed over from elsewhere (a reattached engine).
    pub fn from_string(s: String) -> Result<Self, &'static str> {
        if s.is_empty() {
            return Err("SessionSecret cannot be empty");
        }
        if s.contains([';', '=', '&']) {
            return Err("SessionSecret cannot contain parameter delimiters");
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionSecret {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionSecret(..)")
    }
}
