//! Input validation for identifiers and credentials
//!
//! Guards the gateway against SQL injection through identifiers and keeps
//! credential fields inside sane bounds. Table names reject the internal
//! `_` prefix unless the caller asserts internal access.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

/// Maximum username length
pub const MAX_USERNAME_LENGTH: usize = 50;
/// Maximum password length
pub const MAX_PASSWORD_LENGTH: usize = 100;
/// Maximum table-name length
pub const MAX_TABLE_NAME_LENGTH: usize = 64;
/// Maximum role-name length
pub const MAX_ROLE_NAME_LENGTH: usize = 50;

/// Alphanumeric, underscore, dot, hyphen
static USERNAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_.-]+$").unwrap());
/// Must start with letter or underscore, then alphanumeric or underscore
static TABLE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap());
/// Alphanumeric, space, underscore, hyphen
static ROLE_NAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_ -]+$").unwrap());

/// Validate a username: 1–50 chars, alphanumeric plus `_`, `.`, `-`.
pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(Error::validation("username cannot be empty"));
    }
    if username.len() > MAX_USERNAME_LENGTH {
        return Err(Error::validation(format!(
            "username must not exceed {MAX_USERNAME_LENGTH} characters"
        )));
    }
    if !USERNAME_REGEX.is_match(username) {
        return Err(Error::validation(
            "username contains invalid characters (only alphanumeric, underscore, dot, hyphen allowed)",
        ));
    }
    Ok(())
}

/// Validate a password: 1–100 chars, any content.
pub fn validate_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(Error::validation("password cannot be empty"));
    }
    if password.len() > MAX_PASSWORD_LENGTH {
        return Err(Error::validation(format!(
            "password must not exceed {MAX_PASSWORD_LENGTH} characters"
        )));
    }
    Ok(())
}

/// Validate a table name: 1–64 chars, starts with a letter or underscore,
/// then alphanumeric or underscore. Names starting with `_` address internal
/// tables and are rejected unless `allow_internal` is set.
pub fn validate_table_name(name: &str, allow_internal: bool) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("table name cannot be empty"));
    }
    if name.len() > MAX_TABLE_NAME_LENGTH {
        return Err(Error::validation(format!(
            "table name exceeds maximum length of {MAX_TABLE_NAME_LENGTH} characters"
        )));
    }
    if !TABLE_NAME_REGEX.is_match(name) {
        return Err(Error::validation(
            "invalid table name format: must start with letter/underscore and contain only alphanumeric characters and underscores",
        ));
    }
    if !allow_internal && name.starts_with('_') {
        return Err(Error::forbidden("access to internal tables is not allowed"));
    }
    Ok(())
}

/// Validate a role name: 1–50 chars, alphanumeric plus space, `_`, `-`.
pub fn validate_role_name(role: &str) -> Result<()> {
    if role.is_empty() {
        return Err(Error::validation("role name cannot be empty"));
    }
    if role.len() > MAX_ROLE_NAME_LENGTH {
        return Err(Error::validation(format!(
            "role name must not exceed {MAX_ROLE_NAME_LENGTH} characters"
        )));
    }
    if !ROLE_NAME_REGEX.is_match(role) {
        return Err(Error::validation("role name contains invalid characters"));
    }
    Ok(())
}

/// Validate user fields together. The password and role are optional for
/// updates; empty values skip their checks.
pub fn validate_user_fields(username: &str, password: &str, role: &str) -> Result<()> {
    validate_username(username)
        .map_err(|e| Error::validation(format!("invalid username: {e}")))?;
    if !password.is_empty() {
        validate_password(password)
            .map_err(|e| Error::validation(format!("invalid password: {e}")))?;
    }
    if !role.is_empty() {
        validate_role_name(role).map_err(|e| Error::validation(format!("invalid role: {e}")))?;
    }
    Ok(())
}
