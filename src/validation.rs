//! Configuration validation utilities.

use crate::types::{Error, RateLimitSettings, Result};

/// Validate that a string is not empty.
pub fn validate_non_empty(s: &str, field: &str) -> Result<()> {
    if s.trim().is_empty() {
        return Err(Error::config(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Validate that a value is positive.
pub fn validate_positive(n: u32, field: &str) -> Result<()> {
    if n == 0 {
        return Err(Error::config(format!("{} must be positive", field)));
    }
    Ok(())
}

/// Validate token-bucket settings.
pub fn validate_rate_limit(limit: &RateLimitSettings, item: &str) -> Result<()> {
    if !limit.rate.is_finite() || limit.rate <= 0.0 {
        return Err(Error::config(format!(
            "{}: rate limit rate must be a positive number",
            item
        )));
    }
    validate_positive(limit.burst, &format!("{}: rate limit burst", item))
}
