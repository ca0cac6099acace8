use std::collections::HashMap;

use common::{sha256_hex, validate_identity};
use rand::{rngs::OsRng, RngCore};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::MissionError;

/// Bytes of randomness behind every token (256 bits).
const TOKEN_BYTES: usize = 32;

/// A freshly minted token. The plaintext leaves the authority exactly once.
pub struct IssuedToken {
    pub plaintext: String,
    pub digest: String,
}

impl IssuedToken {
    fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let plaintext = hex::encode(bytes);
        let digest = sha256_hex(plaintext.as_bytes());
        Self { plaintext, digest }
    }
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("plaintext", &"<redacted>")
            .field("digest", &self.digest)
            .finish()
    }
}

/// Issues and rotates bearer tokens per soldier, keeping only their digests.
///
/// One active token per soldier: rotating replaces the stored digest, so the
/// previous plaintext stops verifying immediately.
pub struct TokenAuthority {
    secret_digest: String,
    digests: Mutex<HashMap<String, String>>,
}

impl TokenAuthority {
    pub fn new(rotation_secret: &str) -> Self {
        Self {
            secret_digest: sha256_hex(rotation_secret.as_bytes()),
            digests: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a new token for `soldier` and return its plaintext.
    pub async fn rotate(&self, soldier: &str, requester_secret: &str) -> Result<String, MissionError> {
        // Compared by digest, never as plaintext.
        if sha256_hex(requester_secret.as_bytes()) != self.secret_digest {
            return Err(MissionError::Forbidden);
        }
        if soldier.is_empty() {
            return Err(MissionError::Validation("soldier identity header required".to_string()));
        }
        validate_identity(soldier)?;

        let token = IssuedToken::generate();
        self.digests
            .lock()
            .await
            .insert(soldier.to_string(), token.digest.clone());
        info!(soldier=%soldier, digest=%token.digest, "token rotated");
        Ok(token.plaintext)
    }

    pub async fn digest_of(&self, soldier: &str) -> Result<String, MissionError> {
        self.digests
            .lock()
            .await
            .get(soldier)
            .cloned()
            .ok_or_else(|| MissionError::NotFound(format!("no token issued for soldier '{soldier}'")))
    }

    /// True only if `plaintext` hashes to the digest currently stored for `soldier`.
    pub async fn verify(&self, soldier: &str, plaintext: &str) -> bool {
        let presented = sha256_hex(plaintext.as_bytes());
        match self.digest_of(soldier).await {
            Ok(expected) => !expected.is_empty() && expected == presented,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "super_secret";

    #[tokio::test]
    async fn rotate_returns_256_bit_plaintext_and_stores_only_digest() {
        let auth = TokenAuthority::new(SECRET);
        let plain = auth.rotate("soldier1", SECRET).await.unwrap();
        assert_eq!(plain.len(), TOKEN_BYTES * 2);
        let digest = auth.digest_of("soldier1").await.unwrap();
        assert_ne!(digest, plain);
        assert_eq!(digest, sha256_hex(plain.as_bytes()));
        assert!(auth.verify("soldier1", &plain).await);
    }

    #[tokio::test]
    async fn wrong_secret_is_forbidden() {
        let auth = TokenAuthority::new(SECRET);
        assert!(matches!(
            auth.rotate("soldier1", "guess").await,
            Err(MissionError::Forbidden)
        ));
        // Secret is checked before the identity.
        assert!(matches!(auth.rotate("", "guess").await, Err(MissionError::Forbidden)));
        assert!(matches!(auth.digest_of("soldier1").await, Err(MissionError::NotFound(_))));
    }

    #[tokio::test]
    async fn empty_or_malformed_identity_is_rejected() {
        let auth = TokenAuthority::new(SECRET);
        assert!(matches!(auth.rotate("", SECRET).await, Err(MissionError::Validation(_))));
        assert!(matches!(
            auth.rotate("bad_name", SECRET).await,
            Err(MissionError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn second_rotation_invalidates_first_plaintext() {
        let auth = TokenAuthority::new(SECRET);
        let first = auth.rotate("soldier1", SECRET).await.unwrap();
        let second = auth.rotate("soldier1", SECRET).await.unwrap();
        assert_ne!(first, second);
        assert!(!auth.verify("soldier1", &first).await);
        assert!(auth.verify("soldier1", &second).await);
    }

    #[tokio::test]
    async fn tokens_are_scoped_to_their_soldier() {
        let auth = TokenAuthority::new(SECRET);
        let one = auth.rotate("soldier1", SECRET).await.unwrap();
        auth.rotate("soldier2", SECRET).await.unwrap();
        assert!(!auth.verify("soldier2", &one).await);
        assert!(!auth.verify("soldier3", &one).await);
        assert!(!auth.verify("soldier1", "").await);
    }
}
