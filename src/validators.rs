//! Input validation for block-list domains
//!
//! Domains are normalized and validated here, before they reach the core.
//! The block list in the core assumes every entry is a lower-cased hostname
//! and that no entry appears twice.

/// Maximum length of a DNS name in text form
const MAX_DOMAIN_LEN: usize = 253;

/// Maximum length of one DNS label
const MAX_LABEL_LEN: usize = 63;

/// Reduces user input to a bare, lower-cased hostname.
///
/// Accepts pasted URLs: the scheme, credentials, port, path and trailing dot
/// are dropped.
///
/// # Examples
///
/// ```
/// use hush::validators::normalize_domain;
///
/// assert_eq!(normalize_domain("  Example.COM "), "example.com");
/// assert_eq!(normalize_domain("https://news.example.com:443/path"), "news.example.com");
/// ```
pub fn normalize_domain(input: &str) -> String {
    let mut host = input.trim();
    if let Some((_, rest)) = host.split_once("://") {
        host = rest;
    }
    host = host.split(['/', '?', '#']).next().unwrap_or_default();
    if let Some((_, rest)) = host.rsplit_once('@') {
        host = rest;
    }
    host = host.split(':').next().unwrap_or_default();
    host.trim_start()
        .trim_end_matches(|c: char| c == '.' || c.is_whitespace())
        .to_ascii_lowercase()
}

/// Validates and normalizes a domain.
///
/// # Errors
///
/// Returns `Err` if the normalized name:
/// - Is empty or longer than 253 characters
/// - Has fewer than two labels
/// - Has an empty label, or a label longer than 63 characters
/// - Contains characters other than ASCII letters, digits and `-`
/// - Has a label starting or ending with `-`
pub fn validate_domain(input: &str) -> Result<String, String> {
    let domain = normalize_domain(input);

    if domain.is_empty() {
        return Err("Domain cannot be empty".to_string());
    }

    if domain.len() > MAX_DOMAIN_LEN {
        return Err(format!(
            "Domain too long (max {MAX_DOMAIN_LEN} characters)"
        ));
    }

    if !domain.contains('.') {
        return Err("Domain must include a top-level domain (e.g. example.com)".to_string());
    }

    for label in domain.split('.') {
        if label.is_empty() {
            return Err("Domain contains an empty label".to_string());
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(format!(
                "Domain label too long (max {MAX_LABEL_LEN} characters)"
            ));
        }
        // SECURITY: ASCII only; internationalized names must be entered in punycode
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err("Domain contains invalid characters".to_string());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err("Domain labels cannot start or end with '-'".to_string());
        }
    }

    Ok(domain)
}

/// Validates a domain about to be added to `existing`.
///
/// # Errors
///
/// Returns `Err` if the domain is invalid or already listed.
pub fn validate_new_domain(input: &str, existing: &[String]) -> Result<String, String> {
    let domain = validate_domain(input)?;
    if existing.iter().any(|d| *d == domain) {
        return Err(format!("{domain} is already blocked"));
    }
    Ok(domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_plain_domain() {
        assert_eq!(normalize_domain("example.com"), "example.com");
        assert_eq!(normalize_domain("  Example.COM\t"), "example.com");
        assert_eq!(normalize_domain("example.com."), "example.com");
    }

    #[test]
    fn test_normalize_strips_url_parts() {
        assert_eq!(normalize_domain("https://www.example.com/a/b"), "www.example.com");
        assert_eq!(normalize_domain("http://user:pw@example.com:8080"), "example.com");
        assert_eq!(normalize_domain("example.com?q=1"), "example.com");
    }

    #[test]
    fn test_validate_domain_valid() {
        assert_eq!(validate_domain("Facebook.com").unwrap(), "facebook.com");
        assert_eq!(validate_domain("a-b.c-d.io").unwrap(), "a-b.c-d.io");
        assert_eq!(validate_domain("xn--bcher-kva.example").unwrap(), "xn--bcher-kva.example");
    }

    #[test]
    fn test_validate_domain_empty() {
        assert!(validate_domain("").is_err());
        assert!(validate_domain("   ").is_err());
        assert!(validate_domain("https://").is_err());
    }

    #[test]
    fn test_validate_domain_needs_two_labels() {
        assert!(validate_domain("localhost").is_err());
        assert!(validate_domain("com").is_err());
    }

    #[test]
    fn test_validate_domain_rejects_bad_labels() {
        assert!(validate_domain("exa mple.com").is_err());
        assert!(validate_domain("example..com").is_err());
        assert!(validate_domain("-example.com").is_err());
        assert!(validate_domain("example-.com").is_err());
        assert!(validate_domain("exa\"mple.com").is_err());
        assert!(validate_domain("bücher.example").is_err());
    }

    #[test]
    fn test_validate_domain_length_limits() {
        let long_label = format!("{}.com", "a".repeat(64));
        assert!(validate_domain(&long_label).is_err());

        let max_label = format!("{}.com", "a".repeat(63));
        assert!(validate_domain(&max_label).is_ok());

        let long_name = format!("{}com", "abcdefghi.".repeat(26));
        assert!(validate_domain(&long_name).is_err());
    }

    #[test]
    fn test_validate_new_domain_rejects_duplicates() {
        let existing = vec!["example.com".to_string()];
        assert!(validate_new_domain("EXAMPLE.com", &existing).is_err());
        assert_eq!(
            validate_new_domain("sub.example.com", &existing).unwrap(),
            "sub.example.com"
        );
    }
}
