//! Authentication module for bearer token validation.
//!
//! Provides constant-time token comparison, bearer header extraction and the
//! mapping from a credential to the owner it acts for.

use crate::config::AuthConfig;
use crate::eid::OwnerId;

/// Resolves a presented credential to the owner it acts for.
pub trait CallerVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<OwnerId>;
}

/// Verifier backed by the static `auth.tokens` table of the config.
pub struct StaticTokenVerifier {
    tokens: Vec<(String, OwnerId)>,
}

impl StaticTokenVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            tokens: config
                .tokens
                .iter()
                .map(|entry| (entry.token.clone(), OwnerId::new(entry.owner_id.trim())))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl CallerVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Option<OwnerId> {
        // every entry is compared so timing does not reveal the match position
        let mut found = None;
        for (expected, owner) in &self.tokens {
            if validate_token(token, expected) && found.is_none() {
                found = Some(owner.clone());
            }
        }
        found
    }
}

/// Validates a provided token against the expected token using constant-time comparison.
///
/// This prevents timing attacks by ensuring the comparison takes the same amount
/// of time regardless of where (or if) tokens differ.
///
/// Returns `false` if either token is empty.
pub fn validate_token(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();

    // Empty tokens are never valid
    if provided.is_empty() || expected.is_empty() {
        return false;
    }

    // Length mismatch - still compare to maintain constant time
    // We compare all bytes of the shorter string, then account for length diff
    let len_match = provided.len() == expected.len();

    // XOR accumulator: if any byte differs, result will be non-zero
    let mut diff: u8 = 0;
    for (a, b) in provided.iter().zip(expected.iter()) {
        diff |= a ^ b;
    }

    // Both conditions must be true: same length AND all bytes match
    len_match && diff == 0
}

/// Extracts the bearer token from an Authorization header value.
///
/// Expected format: "Bearer <token>"
/// Returns `None` if the header doesn't match the expected format.
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    let header = header.trim();

    // Case-insensitive "Bearer " prefix check (RFC 6750 allows case-insensitive)
    if header.len() < 7 {
        return None;
    }

    let (prefix, token) = header.split_at(7);
    if prefix.eq_ignore_ascii_case("Bearer ") {
        let token = token.trim();
        if token.is_empty() {
            None
        } else {
            Some(token)
        }
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_token_matching() {
        assert!(validate_token("secret123", "secret123"));
        assert!(validate_token("a", "a"));
        assert!(validate_token(
            "very-long-token-with-special-chars!@#$%",
            "very-long-token-with-special-chars!@#$%"
        ));
    }

    #[test]
    fn test_validate_token_mismatch() {
        assert!(!validate_token("secret123", "secret124"));
        assert!(!validate_token("secret123", "SECRET123"));
        assert!(!validate_token("short", "longer"));
        assert!(!validate_token("longer", "short"));
    }

    #[test]
    fn test_validate_token_empty() {
        assert!(!validate_token("", ""));
        assert!(!validate_token("", "secret"));
        assert!(!validate_token("secret", ""));
    }

    #[test]
    fn test_extract_bearer_token_valid() {
        assert_eq!(extract_bearer_token("Bearer secret123"), Some("secret123"));
        assert_eq!(extract_bearer_token("bearer secret123"), Some("secret123"));
        assert_eq!(extract_bearer_token("BEARER secret123"), Some("secret123"));
        assert_eq!(extract_bearer_token("  Bearer secret123  "), Some("secret123"));
        assert_eq!(extract_bearer_token("Bearer   token-with-spaces  "), Some("token-with-spaces"));
    }

    #[test]
    fn test_static_verifier_maps_token_to_owner() {
        use crate::config::TokenEntry;

        let verifier = StaticTokenVerifier::new(&AuthConfig {
            tokens: vec![
                TokenEntry {
                    token: "alice-token".to_string(),
                    owner_id: "alice".to_string(),
                },
                TokenEntry {
                    token: "bob-token".to_string(),
                    owner_id: "bob".to_string(),
                },
            ],
        });

        assert_eq!(verifier.verify("alice-token"), Some(OwnerId::new("alice")));
        assert_eq!(verifier.verify("bob-token"), Some(OwnerId::new("bob")));
        assert_eq!(verifier.verify("carol-token"), None);
        assert_eq!(verifier.verify(""), None);
        assert!(!verifier.is_empty());
    }

    #[test]
    fn test_extract_bearer_token_invalid() {
        assert_eq!(extract_bearer_token(""), None);
        assert_eq!(extract_bearer_token("Basic secret123"), None);
        assert_eq!(extract_bearer_token("Bearer"), None);
        assert_eq!(extract_bearer_token("Bearer "), None);
        assert_eq!(extract_bearer_token("Bearersecret123"), None);
        assert_eq!(extract_bearer_token("secret123"), None);
    }
}
