//! Authentication support for the sync server.
//!
//! Accounts are checked against SHA-256 password digests at handshake
//! time. A successful handshake issues a session token signed with
//! HMAC-SHA256; every later request presents it.
//!
//! ## Token Format
//!
//! - 8 bytes: origin_id (big-endian)
//! - 8 bytes: issued-at (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 signature over the first 16 bytes
//!
//! Total: 48 bytes, hex-encoded for transport.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::{self, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_LEN: usize = 48;
const SIGNED_LEN: usize = 16;

/// Account table keyed by username.
#[derive(Default)]
pub struct CredentialStore {
    accounts: HashMap<String, [u8; 32]>,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("accounts", &self.accounts.len())
            .finish()
    }
}

impl CredentialStore {
    /// Creates an empty store; every handshake fails until a user is added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an account.
    pub fn add_user(&mut self, username: impl Into<String>, password: &str) {
        let username = username.into();
        let digest = password_digest(&username, password);
        self.accounts.insert(username, digest);
    }

    /// Builder form of [`add_user`](Self::add_user).
    pub fn with_user(mut self, username: impl Into<String>, password: &str) -> Self {
        self.add_user(username, password);
        self
    }

    /// Number of accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Returns true if no accounts exist.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Checks a username and password.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AuthenticationFailed`] on an unknown user or a
    /// wrong password; the message does not say which.
    pub fn verify(&self, username: &str, password: &str) -> ServerResult<()> {
        let candidate = password_digest(username, password);
        match self.accounts.get(username) {
            Some(stored) if constant_time_eq(stored, &candidate) => Ok(()),
            _ => Err(ServerError::AuthenticationFailed(
                "invalid username or password".into(),
            )),
        }
    }
}

fn password_digest(username: &str, password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update([0u8]);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Issues and validates session tokens.
#[derive(Clone)]
pub struct TokenValidator {
    secret: Vec<u8>,
    expiry: Duration,
}

impl fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenValidator")
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl TokenValidator {
    /// Creates a validator with the given secret and token lifetime.
    pub fn new(secret: Vec<u8>, expiry: Duration) -> Self {
        Self { secret, expiry }
    }

    /// Creates a validator with a random 32-byte secret.
    pub fn random(expiry: Duration) -> Self {
        Self::new(rand::random::<[u8; 32]>().to_vec(), expiry)
    }

    /// Issues a token for `origin_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the MAC cannot be keyed.
    pub fn create_token(&self, origin_id: u64) -> ServerResult<String> {
        self.create_token_at(origin_id, now_millis())
    }

    fn create_token_at(&self, origin_id: u64, issued_at: u64) -> ServerResult<String> {
        let mut data = Vec::with_capacity(TOKEN_LEN);
        data.extend_from_slice(&origin_id.to_be_bytes());
        data.extend_from_slice(&issued_at.to_be_bytes());
        let signature = self.mac(&data)?.finalize().into_bytes();
        data.extend_from_slice(&signature);
        Ok(to_hex(&data))
    }

    /// Validates a token and returns the origin it was issued to.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotAuthorized`] if the token is malformed,
    /// forged or expired.
    pub fn validate_token(&self, token: &str) -> ServerResult<u64> {
        let bytes = from_hex(token)
            .filter(|b| b.len() == TOKEN_LEN)
            .ok_or_else(|| ServerError::NotAuthorized("malformed session token".into()))?;
        let (signed, signature) = bytes.split_at(SIGNED_LEN);

        self.mac(signed)?
            .verify_slice(signature)
            .map_err(|_| ServerError::NotAuthorized("invalid session token".into()))?;

        let (origin, issued) = signed.split_at(8);
        let origin_id = u64::from_be_bytes(to_array(origin));
        let issued_at = u64::from_be_bytes(to_array(issued));

        let expiry_millis = self.expiry.as_millis() as u64;
        if now_millis() > issued_at.saturating_add(expiry_millis) {
            return Err(ServerError::NotAuthorized("session expired".into()));
        }
        Ok(origin_id)
    }

    fn mac(&self, data: &[u8]) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ServerError::Internal(format!("token key: {e}")))?;
        mac.update(data);
        Ok(mac)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn to_array(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    out
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new(
            b"test-secret-key-32-bytes-long!!".to_vec(),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn credentials_check_user_and_password() {
        let store = CredentialStore::new().with_user("ana", "hunter2");
        assert_eq!(store.len(), 1);
        assert!(store.verify("ana", "hunter2").is_ok());
        assert!(store.verify("ana", "hunter3").is_err());
        assert!(store.verify("bob", "hunter2").is_err());
        assert!(CredentialStore::new().verify("ana", "hunter2").is_err());
    }

    #[test]
    fn digest_binds_username() {
        assert_ne!(password_digest("ana", "pw"), password_digest("bob", "pw"));
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator();
        let token = validator.create_token(0xDEAD_BEEF).unwrap();
        assert_eq!(token.len(), TOKEN_LEN * 2);
        assert_eq!(validator.validate_token(&token).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn reject_tampered_token() {
        let validator = validator();
        let token = validator.create_token(7).unwrap();
        let mut bytes = from_hex(&token).unwrap();
        bytes[7] ^= 0x01;
        let forged = to_hex(&bytes);
        assert!(matches!(
            validator.validate_token(&forged),
            Err(ServerError::NotAuthorized(_))
        ));
    }

    #[test]
    fn reject_foreign_secret() {
        let other = TokenValidator::new(b"another-secret".to_vec(), Duration::from_secs(60));
        let token = other.create_token(7).unwrap();
        assert!(validator().validate_token(&token).is_err());
    }

    #[test]
    fn reject_expired_token() {
        let validator = validator();
        let token = validator.create_token_at(7, now_millis() - 61_000).unwrap();
        assert!(validator.validate_token(&token).is_err());
    }

    #[test]
    fn reject_garbage() {
        let validator = validator();
        assert!(validator.validate_token("").is_err());
        assert!(validator.validate_token("zz").is_err());
        assert!(validator.validate_token("abc").is_err());
        assert!(validator.validate_token(&"00".repeat(47)).is_err());
    }

    #[test]
    fn hex_round_trip() {
        assert_eq!(to_hex(&[0x00, 0xab, 0xff]), "00abff");
        assert_eq!(from_hex("00abff"), Some(vec![0x00, 0xab, 0xff]));
        assert_eq!(from_hex("é0"), None);
    }
}
