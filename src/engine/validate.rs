//! Content rules for new commands.

use crate::config::EngineConfig;
use crate::error::{PoolError, Result};

/// Link schemes a command must not contain.
const FORBIDDEN_SCHEMES: [&str; 2] = ["http://", "https://"];

/// Trim `raw` and check it against the length and content rules.
///
/// Length is counted in characters, not bytes. Returns the trimmed content.
pub fn validate_content(raw: &str, config: &EngineConfig) -> Result<String> {
    let content = raw.trim();
    let length = content.chars().count();

    if length < config.min_content_chars {
        return Err(PoolError::Validation(format!(
            "content must be at least {} characters",
            config.min_content_chars
        )));
    }

    if length > config.max_content_chars {
        return Err(PoolError::Validation(format!(
            "content must be at most {} characters",
            config.max_content_chars
        )));
    }

    if FORBIDDEN_SCHEMES.iter().any(|scheme| content.contains(scheme)) {
        return Err(PoolError::Validation("content must not contain links".into()));
    }

    Ok(content.to_string())
}
