//! Record ciphers
//!
//! A [`Cipher`] is the state of one direction of one raw connection. It owns
//! a body key, a length key and a single nonce counter, so a (connection,
//! direction) pair never seals two messages under the same nonce.

use super::{CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, Algorithm, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};
use std::fmt;
use std::str::FromStr;

/// Negotiated record encryption scheme.
///
/// Selected once per session at handshake time and symmetric between peers.
/// `Plain` gives neither confidentiality nor integrity and only exists for
/// trusted or diagnostic deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    Plain,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherSuite {
    /// All supported suites
    pub const ALL: [CipherSuite; 3] = [
        CipherSuite::Plain,
        CipherSuite::Aes256Gcm,
        CipherSuite::ChaCha20Poly1305,
    ];

    /// Wire selector carried in the handshake
    pub fn selector(self) -> u8 {
        match self {
            CipherSuite::Plain => 0x00,
            CipherSuite::Aes256Gcm => 0x01,
            CipherSuite::ChaCha20Poly1305 => 0x02,
        }
    }

    /// Parse a wire selector
    pub fn from_selector(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(CipherSuite::Plain),
            0x01 => Some(CipherSuite::Aes256Gcm),
            0x02 => Some(CipherSuite::ChaCha20Poly1305),
            _ => None,
        }
    }

    /// Config name
    pub fn name(self) -> &'static str {
        match self {
            CipherSuite::Plain => "plain",
            CipherSuite::Aes256Gcm => "aes-gcm",
            CipherSuite::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    /// Bytes added to every sealed message
    pub fn overhead(self) -> usize {
        match self {
            CipherSuite::Plain => 0,
            _ => TAG_LEN,
        }
    }

    fn algorithm(self) -> Option<&'static Algorithm> {
        match self {
            CipherSuite::Plain => None,
            CipherSuite::Aes256Gcm => Some(&AES_256_GCM),
            CipherSuite::ChaCha20Poly1305 => Some(&CHACHA20_POLY1305),
        }
    }
}

impl FromStr for CipherSuite {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "none" => Ok(CipherSuite::Plain),
            "aes-gcm" | "aes-256-gcm" => Ok(CipherSuite::Aes256Gcm),
            "chacha20-poly1305" | "chacha20" => Ok(CipherSuite::ChaCha20Poly1305),
            other => Err(CryptoError::UnknownSuite(other.to_string())),
        }
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct SuiteKeys {
    body: LessSafeKey,
    length: LessSafeKey,
}

/// One direction of record protection
pub struct Cipher {
    suite: CipherSuite,
    keys: Option<SuiteKeys>,
    nonce_counter: u64,
}

impl Cipher {
    /// Create a cipher for `suite` from a body key and a length key
    pub fn new(
        suite: CipherSuite,
        key: &[u8; KEY_LEN],
        length_key: &[u8; KEY_LEN],
    ) -> Result<Self, CryptoError> {
        let keys = match suite.algorithm() {
            None => None,
            Some(algorithm) => Some(SuiteKeys {
                body: LessSafeKey::new(
                    UnboundKey::new(algorithm, key).map_err(|_| CryptoError::InvalidKeyLength)?,
                ),
                length: LessSafeKey::new(
                    UnboundKey::new(algorithm, length_key)
                        .map_err(|_| CryptoError::InvalidKeyLength)?,
                ),
            }),
        };

        Ok(Self {
            suite,
            keys,
            nonce_counter: 0,
        })
    }

    /// Cipher that passes data through untouched
    pub fn plain() -> Self {
        Self {
            suite: CipherSuite::Plain,
            keys: None,
            nonce_counter: 0,
        }
    }

    /// Suite in use
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Size of the record length header on the wire
    pub fn header_len(&self) -> usize {
        2 + self.suite.overhead()
    }

    /// Seal a record length into its wire header
    pub fn seal_length(&mut self, length: u16) -> Result<Vec<u8>, CryptoError> {
        let mut header = length.to_be_bytes().to_vec();
        if self.keys.is_some() {
            let nonce = self.next_nonce()?;
            if let Some(keys) = &self.keys {
                keys.length
                    .seal_in_place_append_tag(nonce, Aad::empty(), &mut header)
                    .map_err(|_| CryptoError::Encryption("length seal failed".to_string()))?;
            }
        }
        Ok(header)
    }

    /// Recover a record length from its wire header
    pub fn open_length(&mut self, header: &mut [u8]) -> Result<u16, CryptoError> {
        if header.len() != self.header_len() {
            return Err(CryptoError::AuthenticationFailed);
        }
        if self.keys.is_none() {
            return Ok(u16::from_be_bytes([header[0], header[1]]));
        }

        let nonce = self.next_nonce()?;
        let keys = self.keys.as_ref().ok_or(CryptoError::AuthenticationFailed)?;
        let plain = keys
            .length
            .open_in_place(nonce, Aad::empty(), header)
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        Ok(u16::from_be_bytes([plain[0], plain[1]]))
    }

    /// Encrypt a record body in place, appending the auth tag
    pub fn seal_in_place(&mut self, buffer: &mut Vec<u8>) -> Result<(), CryptoError> {
        if self.keys.is_none() {
            return Ok(());
        }
        let nonce = self.next_nonce()?;
        if let Some(keys) = &self.keys {
            keys.body
                .seal_in_place_append_tag(nonce, Aad::empty(), buffer)
                .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;
        }
        Ok(())
    }

    /// Decrypt a record body in place, verifying and stripping the tag
    ///
    /// Returns the plaintext slice of `buffer`.
    pub fn open_in_place<'a>(&mut self, buffer: &'a mut [u8]) -> Result<&'a mut [u8], CryptoError> {
        if self.keys.is_none() {
            return Ok(buffer);
        }
        let nonce = self.next_nonce()?;
        let keys = self.keys.as_ref().ok_or(CryptoError::AuthenticationFailed)?;
        keys.body
            .open_in_place(nonce, Aad::empty(), buffer)
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// Current nonce counter value
    pub fn nonce_counter(&self) -> u64 {
        self.nonce_counter
    }

    fn next_nonce(&mut self) -> Result<Nonce, CryptoError> {
        if self.nonce_counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce[4..12].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter += 1;
        Ok(Nonce::assume_unique_for_key(nonce))
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher")
            .field("suite", &self.suite)
            .field("nonce_counter", &self.nonce_counter)
            .finish()
    }
}
