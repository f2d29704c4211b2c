//! OAuth client + credential-bundle provisioning for server records
//! (spec.md §4.E.6).

use argon2::password_hash::{PasswordHasher, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;

use crate::error::{ControlPlaneError, Result};
use crate::model::{OAuthClient, OAuthClientSpec};
use crate::secrets::CredentialBundle;
use crate::utils::{generate_api_key, hash_secret, random_prefixed_id, random_secret};

/// Slow-KDF hash for an OAuth client secret (never the same as
/// [`crate::utils::hash_secret`]'s integrity-check digest, which is a plain
/// SHA-256 used only to detect drift, not to protect a stored secret).
pub fn hash_client_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ControlPlaneError::bad_request(format!("failed to hash client secret: {e}")))
}

pub fn verify_client_secret(secret: &str, stored_hash: &str) -> bool {
    use argon2::password_hash::PasswordVerifier;
    let Ok(parsed) = argon2::PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default().verify_password(secret.as_bytes(), &parsed).is_ok()
}

/// A freshly minted `E_oc` plus the credential bundle to write to the secret
/// store under the server's context (spec.md §4.E.6).
pub struct ProvisionedCredentials {
    pub oauth_client: OAuthClient,
    pub bundle: CredentialBundle,
    pub audit_log_token_hash: String,
}

pub fn provision(namespace: &str, server_name: &str) -> Result<ProvisionedCredentials> {
    let client_id = random_prefixed_id("mcp-", 16);
    let client_secret = random_secret(32);
    let client_secret_hash = hash_client_secret(&client_secret)?;
    let audit_log_token = generate_api_key();

    let oauth_client = OAuthClient::new(
        namespace,
        server_name,
        OAuthClientSpec {
            server_name: server_name.to_string(),
            client_id: client_id.clone(),
            client_secret_hash,
            grant_types: vec!["client_credentials".to_string()],
        },
    );

    let mut bundle = CredentialBundle::new();
    bundle.insert("TOKEN_EXCHANGE_CLIENT_ID".to_string(), format!("{namespace}:{client_id}"));
    bundle.insert("TOKEN_EXCHANGE_CLIENT_SECRET".to_string(), client_secret);
    bundle.insert("AUDIT_LOG_TOKEN".to_string(), audit_log_token.clone());

    Ok(ProvisionedCredentials {
        oauth_client,
        bundle,
        audit_log_token_hash: hash_secret(&audit_log_token),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_secret_round_trips_through_argon2() {
        let hash = hash_client_secret("s3cr3t").unwrap();
        assert!(verify_client_secret("s3cr3t", &hash));
        assert!(!verify_client_secret("wrong", &hash));
    }

    #[test]
    fn provision_mints_distinct_ids() {
        let a = provision("ns", "server1").unwrap();
        let b = provision("ns", "server1").unwrap();
        assert_ne!(a.oauth_client.spec.client_id, b.oauth_client.spec.client_id);
        assert!(a.bundle.contains_key("TOKEN_EXCHANGE_CLIENT_ID"));
        assert!(a.bundle.contains_key("AUDIT_LOG_TOKEN"));
    }
}
