//! Secret types for protecting sensitive values from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate. Use these types for
//! credentials handed to verification runs, such as the cloud API access token.
//!
//! `SecretString` implements `Debug` with redaction, so any configuration struct
//! that derives `Debug` and holds one is safe to log with `{:?}` or tracing.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct ApiCredentials {
//!     project_id: String,
//!     access_token: SecretString,
//! }
//!
//! let creds = ApiCredentials {
//!     project_id: "my-project".to_string(),
//!     access_token: SecretString::from("ya29.token"),
//! };
//!
//! let rendered = format!("{:?}", creds);
//! assert!(!rendered.contains("ya29.token"));
//!
//! // Reading the value requires an explicit call.
//! let token: &str = creds.access_token.expose_secret();
//! assert_eq!(token, "ya29.token");
//! ```

pub use secrecy::{ExposeSecret, SecretString};
