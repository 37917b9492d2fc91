use std::fmt;

use rand::RngCore;
use sha2::{Digest, Sha256};

const REALM: &str = "DB_Auth";

/// Precomputed hash forms of a credential pair
#[derive(Clone)]
pub struct PasswordDigest {
    basic_secret: String,
    crypt_base: String,
    challenge_base: String,
    password: String,
}

impl PasswordDigest {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            basic_secret: sha256_hex(password),
            crypt_base: sha256_hex(&format!("{}:{}", user, password)),
            challenge_base: md5_hex(&format!("{}:{}:{}", user, REALM, password)),
            password: password.to_string(),
        }
    }

    pub fn basic_secret(&self) -> &str {
        &self.basic_secret
    }

    pub fn crypt_base(&self) -> &str {
        &self.crypt_base
    }

    pub fn challenge_base(&self) -> &str {
        &self.challenge_base
    }

    /// Plain password, sent only for externally verified accounts
    pub(crate) fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for PasswordDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordDigest")
            .field("basic_secret", &"<redacted>")
            .finish_non_exhaustive()
    }
}

pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

pub fn md5_hex(value: &str) -> String {
    format!("{:x}", md5::compute(value.as_bytes()))
}

/// Fresh client nonce: four random bytes, hex encoded
pub fn generate_cnonce() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
