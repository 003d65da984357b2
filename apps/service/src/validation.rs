use url::Url;

use crate::error::{ProbeFailure, ValidationError};
use crate::monitoring::checker::parse_target;

/// Check the url is an absolute http(s) URL with a host
pub fn validate_url(url: &str) -> Result<Url, ValidationError> {
    if url.trim().is_empty() {
        return Err(ValidationError::MissingUrl);
    }

    parse_target(url).map_err(|e| match e {
        ProbeFailure::InvalidUrl(reason) => ValidationError::BadUrl(reason),
        other => ValidationError::BadUrl(other.to_string()),
    })
}

/// Loose address check: something, an `@`, something, a dot, something.
///
/// Deliverability is the mail system's problem.
pub fn validate_email(email: &str) -> Result<&str, ValidationError> {
    let email = email.trim();
    if email.is_empty() {
        return Err(ValidationError::MissingEmail);
    }

    let looks_valid = email.char_indices().any(|(at, c)| {
        if c != '@' || at == 0 {
            return false;
        }
        let domain = &email[at + 1..];
        domain
            .char_indices()
            .any(|(dot, c)| c == '.' && dot > 0 && dot + 1 < domain.len())
    });

    if looks_valid {
        Ok(email)
    } else {
        Err(ValidationError::BadEmail(email.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com").is_ok());
        assert!(validate_url("http://127.0.0.1:8080/health").is_ok());

        assert_eq!(validate_url(""), Err(ValidationError::MissingUrl));
        assert_eq!(validate_url("   "), Err(ValidationError::MissingUrl));
        assert!(matches!(validate_url("example.com"), Err(ValidationError::BadUrl(_))));
        assert!(matches!(validate_url("ftp://example.com"), Err(ValidationError::BadUrl(_))));
    }

    #[test]
    fn test_validate_email() {
        assert_eq!(validate_email("ops@example.com"), Ok("ops@example.com"));
        assert_eq!(validate_email(" a@b.co "), Ok("a@b.co"));
        assert!(validate_email("first.last@mail.example.org").is_ok());

        assert_eq!(validate_email(""), Err(ValidationError::MissingEmail));
        for bad in ["nobody", "@example.com", "a@example", "a@.com", "a@example."] {
            assert!(
                matches!(validate_email(bad), Err(ValidationError::BadEmail(_))),
                "{bad} should be rejected"
            );
        }
    }
}
