//! Credential vault: symmetric encryption of provider API keys, keyed HMAC
//! digesting of bearer tokens, password hashing, and the signed JWT used for
//! password-protected view access.
//!
//! Three 256-bit keys are derived from the process-wide `ENCRYPTION_KEY`
//! secret. Storing token HMACs instead of plain hashes means a leaked
//! database alone cannot be brute-forced offline; an attacker also needs the
//! process secret.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const BCRYPT_COST: u32 = 12;

pub const JWT_ISSUER: &str = "vitrine";
pub const JWT_AUDIENCE: &str = "view-access";
pub const JWT_OWNER_AUDIENCE: &str = "owner";

#[derive(Debug, Error)]
pub enum CryptoError {
    /// GCM authentication tag did not verify: the blob was modified or was
    /// encrypted under a different key.
    #[error("ciphertext failed authentication")]
    Tampered,

    /// The blob is not valid base64 or is shorter than one nonce.
    #[error("malformed ciphertext")]
    Malformed,

    #[error("password hashing failed: {0}")]
    Password(#[from] bcrypt::BcryptError),

    #[error("token signing failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Claims carried by a password-protected view access token.
#[derive(Debug, Serialize, Deserialize)]
pub struct ViewAccessClaims {
    /// View the token grants access to.
    pub vid: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    /// Random id for audit / future revocation.
    pub jti: String,
}

/// Claims carried by an owner session token.
#[derive(Debug, Serialize, Deserialize)]
pub struct OwnerClaims {
    /// Owner email.
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Immutable after construction; safe to share across request tasks without
/// synchronization.
pub struct Vault {
    enc_key: [u8; 32],
    hmac_key: [u8; 32],
    jwt_key: [u8; 32],
}

fn derive_key(secret: &str, purpose: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(purpose.as_bytes());
    hasher.finalize().into()
}

impl Vault {
    pub fn new(secret: &str) -> Self {
        Self {
            enc_key: derive_key(secret, ":encryption"),
            hmac_key: derive_key(secret, ":hmac"),
            jwt_key: derive_key(secret, ":jwt"),
        }
    }

    /// Encrypts plaintext with AES-256-GCM under a fresh 96-bit nonce.
    /// Output is `base64(nonce || ciphertext || tag)`. Empty input yields
    /// empty output.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let cipher = Aes256Gcm::new((&self.enc_key).into());
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CryptoError::Tampered)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    /// Decrypts a blob produced by [`Vault::encrypt`]. Empty input yields
    /// empty output.
    pub fn decrypt(&self, encrypted: &str) -> Result<String, CryptoError> {
        if encrypted.is_empty() {
            return Ok(String::new());
        }

        let blob = STANDARD.decode(encrypted).map_err(|_| CryptoError::Malformed)?;
        if blob.len() < NONCE_LEN {
            return Err(CryptoError::Malformed);
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new((&self.enc_key).into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Tampered)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Tampered)
    }

    /// Keyed digest of a raw bearer token for storage. Deterministic: the
    /// same raw token always yields the same digest under the same secret.
    pub fn hmac_token(&self, token: &str) -> String {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.hmac_key)
            .expect("HMAC accepts any key length");
        mac.update(token.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Constant-time comparison of a raw token against a stored digest.
    pub fn verify_token(&self, token: &str, stored_hmac: &str) -> bool {
        let expected = self.hmac_token(token);
        expected.as_bytes().ct_eq(stored_hmac.as_bytes()).into()
    }

    pub fn hash_password(&self, password: &str) -> Result<String, CryptoError> {
        Ok(bcrypt::hash(password, BCRYPT_COST)?)
    }

    /// The bcrypt library performs its own constant-time check.
    pub fn check_password(&self, password: &str, hash: &str) -> bool {
        bcrypt::verify(password, hash).unwrap_or(false)
    }

    /// `n_bytes` of CSPRNG output rendered as URL-safe base64 (unpadded,
    /// 43 chars for 32 bytes).
    pub fn random_token(&self, n_bytes: usize) -> String {
        let mut bytes = vec![0u8; n_bytes];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Issues a signed JWT granting access to one password-protected view.
    /// Returns the token and its expiry.
    pub fn issue_view_access_jwt(
        &self,
        view_id: &str,
        ttl: Duration,
    ) -> Result<(String, DateTime<Utc>), CryptoError> {
        let now = Utc::now();
        let expires_at = now + ttl;

        let claims = ViewAccessClaims {
            vid: view_id.to_string(),
            iss: JWT_ISSUER.to_string(),
            aud: JWT_AUDIENCE.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: self.random_token(16),
        };

        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.jwt_key),
        )?;
        Ok((token, expires_at))
    }

    /// Validates a view access JWT and returns the view id it was issued for.
    pub fn validate_view_access_jwt(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[JWT_ISSUER]);
        validation.set_audience(&[JWT_AUDIENCE]);

        let data = jsonwebtoken::decode::<ViewAccessClaims>(
            token,
            &DecodingKey::from_secret(&self.jwt_key),
            &validation,
        )
        .ok()?;

        if data.claims.vid.is_empty() {
            return None;
        }
        Some(data.claims.vid)
    }

    /// Issues an owner session token for an authenticated admin email.
    pub fn issue_owner_jwt(
        &self,
        email: &str,
        ttl: Duration,
    ) -> Result<(String, DateTime<Utc>), CryptoError> {
        let now = Utc::now();
        let expires_at = now + ttl;

        let claims = OwnerClaims {
            sub: email.to_string(),
            iss: JWT_ISSUER.to_string(),
            aud: JWT_OWNER_AUDIENCE.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: self.random_token(16),
        };

        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.jwt_key),
        )?;
        Ok((token, expires_at))
    }

    /// Validates an owner session token and returns the owner email.
    pub fn validate_owner_jwt(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[JWT_ISSUER]);
        validation.set_audience(&[JWT_OWNER_AUDIENCE]);

        let data = jsonwebtoken::decode::<OwnerClaims>(
            token,
            &DecodingKey::from_secret(&self.jwt_key),
            &validation,
        )
        .ok()?;

        if data.claims.sub.is_empty() {
            return None;
        }
        Some(data.claims.sub)
    }
}
