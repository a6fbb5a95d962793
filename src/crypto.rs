//! AES-256-GCM block encryption and Argon2id key derivation.
//!
//! Key derivation: Argon2id(password, salt=archive-id bytes) → 32-byte key
//! Encryption:     AES-256-GCM, nonce prepended to ciphertext
//!
//! Encrypted payload layout: [ nonce (12 B) | ciphertext | GCM tag (16 B) ]
//!
//! The main archive header carries a password-check pair so that a restore
//! with the wrong password fails before anything is written to the
//! destination: a random clear buffer is hashed (MD5) and encrypted at save
//! time; the restorer decrypts and compares.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use argon2::{Algorithm, Argon2, Params, Version};
use md5::{Digest, Md5};
use thiserror::Error;

/// Byte length of the AES-GCM nonce prepended to every encrypted payload.
pub const NONCE_LEN: usize = 12;

/// Size of the random password-check buffer stored in the main header.
pub const PASSCHECK_SIZE: usize = 4096;

pub const MIN_PASS_LEN: usize = 6;
pub const MAX_PASS_LEN: usize = 64;

// ── Frozen wire ids (block header `encryptalgo` key) ─────────────────────────

pub const CRYPTO_NULL: u16 = 0;
pub const CRYPTO_NONE: u16 = 1;
pub const CRYPTO_AES256: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptAlgo {
    None,
    Aes256,
}

impl EncryptAlgo {
    #[inline]
    pub fn wire_id(self) -> u16 {
        match self {
            EncryptAlgo::None => CRYPTO_NONE,
            EncryptAlgo::Aes256 => CRYPTO_AES256,
        }
    }

    pub fn from_wire_id(id: u16) -> Option<Self> {
        match id {
            CRYPTO_NONE => Some(EncryptAlgo::None),
            CRYPTO_AES256 => Some(EncryptAlgo::Aes256),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EncryptAlgo::None => "none",
            EncryptAlgo::Aes256 => "aes256",
        }
    }
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed — wrong password or corrupted data")]
    DecryptionFailed,
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("encrypted payload too short (minimum {NONCE_LEN} bytes)")]
    TooShort,
    #[error("password must be {MIN_PASS_LEN} to {MAX_PASS_LEN} characters")]
    BadPassword,
}

/// Validate password length against the format limits.
pub fn check_password(password: &str) -> Result<(), CryptoError> {
    let n = password.len();
    if !(MIN_PASS_LEN..=MAX_PASS_LEN).contains(&n) {
        return Err(CryptoError::BadPassword);
    }
    Ok(())
}

/// Derive a 256-bit key from a password and the archive id using Argon2id.
///
/// The salt is a fixed tag plus the archive id, giving each archive a
/// distinct key even when the same password is reused across archives.
pub fn derive_key(password: &str, archid: u32) -> Result<[u8; 32], CryptoError> {
    check_password(password)?;
    let mut salt = [0u8; 12];
    salt[..8].copy_from_slice(b"fsark-kd");
    salt[8..].copy_from_slice(&archid.to_le_bytes());
    let params = Params::new(64 * 1024, 3, 1, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), &salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Encrypt `plaintext` with AES-256-GCM using a random nonce.
///
/// Returns `nonce (12 B) || ciphertext || GCM-tag (16 B)`.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::EncryptionFailed)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an AES-256-GCM payload produced by [`encrypt`].
pub fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::TooShort);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::DecryptionFailed)?;
    let nonce = aes_gcm::Nonce::from_slice(&data[..NONCE_LEN]);
    cipher
        .decrypt(nonce, &data[NONCE_LEN..])
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Build the password-check pair stored in the main header:
/// `(md5_of_clear_buffer, encrypted_buffer)`.
pub fn make_passcheck(key: &[u8; 32]) -> Result<([u8; 16], Vec<u8>), CryptoError> {
    let mut clear = vec![0u8; PASSCHECK_SIZE];
    OsRng.fill_bytes(&mut clear);
    let md5: [u8; 16] = Md5::digest(&clear).into();
    let crypt = encrypt(key, &clear)?;
    Ok((md5, crypt))
}

/// Verify a password-check pair read from the main header.
///
/// Ok(()) means the derived key decrypts the buffer to bytes whose MD5
/// matches the stored clear-buffer digest; anything else means the
/// password is wrong (or the header is corrupt).
pub fn verify_passcheck(key: &[u8; 32], md5_clear: &[u8; 16], crypt: &[u8]) -> Result<(), CryptoError> {
    let clear = decrypt(key, crypt)?;
    let actual: [u8; 16] = Md5::digest(&clear).into();
    if &actual != md5_clear {
        return Err(CryptoError::DecryptionFailed);
    }
    Ok(())
}
