use crate::status_bail;
use regex::Regex;
use std::sync::LazyLock;
use warp::http::StatusCode;

/// Allowed characters for tenant/user/campaign identifiers: letters,
/// digits, '_', '-' and '.'.
static VALID_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\-.]{1,64}$").expect("Invalid regex"));

pub fn is_valid_id(id: &str) -> bool {
    VALID_ID_REGEX.is_match(id)
}

pub fn validate_id<S: AsRef<str>>(field_name: &str, id: S) -> anyhow::Result<S> {
    if !is_valid_id(id.as_ref()) {
        status_bail!(
            StatusCode::BAD_REQUEST,
            "'{}' must be 1-64 characters of letters, digits, '_', '-' or '.'",
            field_name
        );
    }

    Ok(id)
}

pub fn validate_str<S: AsRef<str>>(
    field_name: &str,
    data: S,
    min_length: usize,
    max_length: usize,
) -> anyhow::Result<S> {
    let len = data.as_ref().len();
    if len < min_length || len > max_length {
        status_bail!(
            StatusCode::BAD_REQUEST,
            "'{}' must be between {} and {} characters long",
            field_name,
            min_length,
            max_length
        );
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_identifiers() {
        assert!(is_valid_id("tenant-1"));
        assert!(is_valid_id("user_42"));
        assert!(is_valid_id("demo.tenant"));
    }

    #[test]
    fn rejects_empty_overlong_and_exotic_identifiers() {
        assert!(!is_valid_id(""));
        assert!(!is_valid_id(&"a".repeat(65)));
        assert!(!is_valid_id("tenant/1"));
        assert!(!is_valid_id("tenant 1"));
        assert!(!is_valid_id("tenant#1"));
    }

    #[test]
    fn validate_id_reports_the_field_name() {
        let err = validate_id("tenant_id", "bad id!").unwrap_err();
        assert!(err.to_string().contains("tenant_id"));
    }

    #[test]
    fn validate_str_enforces_bounds() {
        assert!(validate_str("subject", "hello", 1, 10).is_ok());
        assert!(validate_str("subject", "", 1, 10).is_err());
        assert!(validate_str("subject", "0123456789x", 1, 10).is_err());
    }
}
