//! Actual-vs-expected configuration comparison.
//!
//! [`validate`] compares every declared field and collects each difference in a
//! [`MismatchReport`], so a single run surfaces all configuration drift at once.

use crate::model::{ExpectedState, ResourceDescriptor};
use std::fmt;

/// Placeholder recorded as the actual value of an absent key.
pub const MISSING: &str = "missing";

/// One field whose actual value differs from the expected one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub field: String,
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected '{}', got '{}'",
            self.field, self.expected, self.actual
        )
    }
}

/// Ordered list of mismatches; empty means the resource matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MismatchReport {
    entries: Vec<Mismatch>,
}

impl MismatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mismatch for `field` when `expected != actual`.
    pub fn compare(&mut self, field: impl Into<String>, expected: &str, actual: &str) {
        if expected != actual {
            self.entries.push(Mismatch {
                field: field.into(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[Mismatch] {
        &self.entries
    }

    /// Find the mismatch recorded for `field`.
    pub fn get(&self, field: &str) -> Option<&Mismatch> {
        self.entries.iter().find(|m| m.field == field)
    }
}

impl fmt::Display for MismatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.entries.iter().map(ToString::to_string).collect();
        write!(f, "{}", rendered.join("; "))
    }
}

/// Compare `actual` against `expected`, inspecting every declared field.
///
/// Fields are checked in a fixed order: env vars (sorted by key), container
/// port, limits (sorted by name), ingress. A key absent from `actual` is
/// reported with the actual value [`MISSING`].
pub fn validate(actual: &ResourceDescriptor, expected: &ExpectedState) -> MismatchReport {
    let mut report = MismatchReport::new();

    for (key, expected_value) in &expected.env {
        let actual_value = actual.env.get(key).map_or(MISSING, String::as_str);
        report.compare(format!("env.{key}"), expected_value, actual_value);
    }

    report.compare(
        "container_port",
        &expected.container_port.to_string(),
        &actual.container_port.to_string(),
    );

    for (name, expected_value) in &expected.limits {
        let actual_value = actual.limits.get(name).map_or(MISSING, String::as_str);
        report.compare(format!("limits.{name}"), expected_value, actual_value);
    }

    report.compare(
        "ingress",
        &expected.ingress.to_string(),
        &actual.ingress.to_string(),
    );

    report
}
