//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides a redaction helper for printing
//! configuration that may hold credentials.

pub use secrecy::{ExposeSecret, SecretString};

/// Render an optional secret for display without exposing it.
pub fn redacted(secret: Option<&SecretString>) -> &'static str {
    match secret {
        Some(s) if !s.expose_secret().is_empty() => "[REDACTED]",
        Some(_) => "(empty)",
        None => "(unset)",
    }
}
