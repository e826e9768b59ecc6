use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A freshly issued opaque token. The plaintext is emailed to the user once;
/// only the hash is ever persisted, so the database never holds a usable
/// secret.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub plain: String,
    pub hash: String,
}

/// Issues a URL-safe token with 122 bits of randomness and its storage hash.
pub fn issue() -> IssuedToken {
    let plain = Uuid::new_v4().to_string();
    let hash = hash_token(&plain);
    IssuedToken { plain, hash }
}

/// SHA-256 hex digest of a token, used for storage and lookup.
pub fn hash_token(plain: &str) -> String {
    hex::encode(Sha256::digest(plain.as_bytes()))
}
