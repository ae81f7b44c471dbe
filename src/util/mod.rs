//! Utility functions shared across modules.
//!
//! - **URL validation**: scheme and host checks for configured source URLs

mod url_validator;

pub use url_validator::{validate_source_url, HostPolicy, UrlValidationError};

/// Current time as Unix seconds, the timestamp unit used by storage.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
