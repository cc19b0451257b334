//! Cryptographic primitives for Shadowmux
//!
//! This module provides:
//! - Noise Protocol handshake (N pattern) for admission and key agreement
//! - Per-direction record ciphers (plain, AES-256-GCM, ChaCha20-Poly1305)
//! - X25519 key generation
//! - HKDF-SHA256 key derivation
//! - Secure random number generation

mod aead;
mod handshake;
mod kdf;
mod keys;

pub use aead::{Cipher, CipherSuite};
pub use handshake::{HandshakeRole, NoiseHandshake};
pub use kdf::{derive_session_keys, Hkdf, SessionKeys};
pub use keys::{KeyPair, PrivateKey, PublicKey};

use thiserror::Error;

/// Noise Protocol pattern used for the handshake.
/// N: one message, the client knows the server's static public key and the
/// server learns nothing about the client beyond the encrypted payload.
pub const NOISE_PATTERN: &str = "Noise_N_25519_ChaChaPoly_SHA256";

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Nonce space exhausted")]
    NonceExhausted,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Unknown cipher suite: {0}")]
    UnknownSuite(String),

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}

/// Generate a random u32 (session identifiers)
pub fn random_u32() -> u32 {
    let mut buf = [0u8; 4];
    random_bytes(&mut buf);
    u32::from_le_bytes(buf)
}
