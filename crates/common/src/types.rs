//! Common data types for verification runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Length of a generated run identifier.
pub const RUN_ID_LEN: usize = 8;

/// Unique identifier for one verification run.
///
/// Embedded in every provisioned resource name so that concurrent runs never
/// collide on shared infrastructure names. Always lowercase, since cloud
/// resource names reject uppercase characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    /// Create a new random run ID
    #[must_use]
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        let short = uuid.get(..RUN_ID_LEN).unwrap_or("00000000");
        Self(short.to_string())
    }

    /// Use a caller-supplied identifier, normalized to lowercase.
    #[must_use]
    pub fn from_supplied(id: &str) -> Self {
        Self(id.trim().to_lowercase())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build a resource name of the form `{prefix}-{run_id}`.
    #[must_use]
    pub fn resource_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.0)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
