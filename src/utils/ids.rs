//! Random identifier generation (OAuth client ids/secrets, API keys).

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Generate a random lowercase alphanumeric id, prefixed, as described for
/// `E_srv` OAuth client provisioning (spec.md §4.E.6: "a random `clientID`
/// (prefixed and lowercased)").
pub fn random_prefixed_id(prefix: &str, len: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect();
    format!("{prefix}{}", suffix.to_lowercase())
}

/// Generate a random opaque secret (client secrets, audit-log tokens, API
/// keys) as a hex string.
pub fn random_secret(byte_len: usize) -> String {
    let bytes: Vec<u8> = (0..byte_len).map(|_| rand::thread_rng().gen()).collect();
    hex::encode(bytes)
}

/// Generate an API key token with the `ok1-` prefix used throughout the
/// inbound HTTP surface (spec.md §6 "API keys").
pub fn generate_api_key() -> String {
    format!("ok1-{}", random_secret(24))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_id_is_lowercase_and_prefixed() {
        let id = random_prefixed_id("mcp-", 12);
        assert!(id.starts_with("mcp-"));
        assert_eq!(id, id.to_lowercase());
        assert_eq!(id.len(), 4 + 12);
    }

    #[test]
    fn api_key_has_expected_prefix() {
        assert!(generate_api_key().starts_with("ok1-"));
    }
}
