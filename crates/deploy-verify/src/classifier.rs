//! Transient-vs-fatal error classification.
//!
//! Retry loops ask an [`ErrorClassifier`] whether an error is known and
//! expected to resolve on its own. Any `Fn(&E) -> bool` closure is a
//! classifier; [`SubstringClassifier`] and [`RegexClassifier`] cover the
//! message-matching cases.

use regex::RegexSet;
use std::fmt;

/// Error message fragments emitted while Cloud Run still holds the
/// `serverless-ipv4` address that blocks VPC and subnet deletion.
///
/// The platform releases the address 5-10 minutes after the service is
/// deleted, so a destroy that fails with one of these succeeds later.
pub const SERVERLESS_IPV4_RELEASE_PATTERNS: [&str; 3] =
    ["serverless-ipv4", "already being used", "servicenetworking"];

/// Terraform failures that are worth retrying as-is.
///
/// Registry hiccups, provider download problems and plugin start-up races.
pub const TERRAFORM_RETRYABLE_PATTERNS: [&str; 10] = [
    "read: connection reset by peer",
    "unable to verify signature",
    "unable to verify checksum",
    "registry service is unreachable",
    "Error installing provider",
    "Failed to query available provider packages",
    "timeout while waiting for plugin to start",
    "timed out waiting for server handshake",
    "could not query provider registry for",
    "TLS handshake timeout",
];

/// Decides whether an error is transient.
pub trait ErrorClassifier<E: ?Sized>: Send + Sync {
    /// Returns true if the error is expected to resolve on retry.
    fn is_transient(&self, error: &E) -> bool;
}

impl<E: ?Sized, F> ErrorClassifier<E> for F
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn is_transient(&self, error: &E) -> bool {
        self(error)
    }
}

/// Classifies an error as transient when its message contains any pattern.
///
/// An empty pattern list classifies nothing as transient.
#[derive(Debug, Clone, Default)]
pub struct SubstringClassifier {
    patterns: Vec<String>,
}

impl SubstringClassifier {
    /// Create a classifier from message fragments.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// Classifier for the serverless-ipv4 release delay during VPC teardown.
    pub fn serverless_ipv4_release() -> Self {
        Self::new(SERVERLESS_IPV4_RELEASE_PATTERNS)
    }

    /// Returns true if `message` contains at least one pattern.
    pub fn matches(&self, message: &str) -> bool {
        self.patterns.iter().any(|p| message.contains(p.as_str()))
    }
}

impl<E: fmt::Display + ?Sized> ErrorClassifier<E> for SubstringClassifier {
    fn is_transient(&self, error: &E) -> bool {
        self.matches(&error.to_string())
    }
}

/// Classifies an error as transient when its message matches any regex.
#[derive(Debug, Clone)]
pub struct RegexClassifier {
    set: RegexSet,
}

impl RegexClassifier {
    /// Compile a classifier from regex patterns.
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            set: RegexSet::new(patterns)?,
        })
    }

    /// Classifier for transient `terraform init` / `apply` failures.
    pub fn terraform_retryable() -> Result<Self, regex::Error> {
        Self::new(TERRAFORM_RETRYABLE_PATTERNS.iter().map(|p| regex::escape(p)))
    }

    /// Returns true if `message` matches at least one pattern.
    pub fn matches(&self, message: &str) -> bool {
        self.set.is_match(message)
    }
}

impl<E: fmt::Display + ?Sized> ErrorClassifier<E> for RegexClassifier {
    fn is_transient(&self, error: &E) -> bool {
        self.matches(&error.to_string())
    }
}
