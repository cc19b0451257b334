//! Key Derivation Functions
//!
//! Provides HKDF-SHA256 for deriving record keys from the handshake hash

use super::{Cipher, CipherSuite, CryptoError, HandshakeRole, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material
    ///
    /// # Arguments
    /// * `salt` - Optional salt (if None, uses zeros)
    /// * `ikm` - Input keying material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };
        let prk = salt.extract(ikm);
        Self { prk }
    }

    /// Derive a key from the PRK
    ///
    /// # Arguments
    /// * `info` - Context and application-specific information
    /// * `output` - Buffer to write derived key to
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyGeneration("HKDF expand failed".to_string()))?;

        okm.fill(output)
            .map_err(|_| CryptoError::KeyGeneration("HKDF fill failed".to_string()))?;

        Ok(())
    }

    /// Derive a 32-byte key
    pub fn expand_key(&self, info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut key = [0u8; KEY_LEN];
        self.expand(info, &mut key)?;
        Ok(key)
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Keys for one raw connection, one pair per direction
#[derive(Clone)]
pub struct SessionKeys {
    pub client_key: [u8; KEY_LEN],
    pub client_length_key: [u8; KEY_LEN],
    pub server_key: [u8; KEY_LEN],
    pub server_length_key: [u8; KEY_LEN],
}

impl SessionKeys {
    /// Build the (send, receive) ciphers for our side of the connection
    pub fn ciphers(
        &self,
        suite: CipherSuite,
        role: HandshakeRole,
    ) -> Result<(Cipher, Cipher), CryptoError> {
        let client = Cipher::new(suite, &self.client_key, &self.client_length_key)?;
        let server = Cipher::new(suite, &self.server_key, &self.server_length_key)?;
        Ok(match role {
            HandshakeRole::Initiator => (client, server),
            HandshakeRole::Responder => (server, client),
        })
    }
}

/// Derive record keys from the Noise handshake hash
pub fn derive_session_keys(handshake_hash: &[u8]) -> Result<SessionKeys, CryptoError> {
    let hkdf = Hkdf::new(None, handshake_hash);
    Ok(SessionKeys {
        client_key: hkdf.expand_key(b"shadowmux client record key")?,
        client_length_key: hkdf.expand_key(b"shadowmux client length key")?,
        server_key: hkdf.expand_key(b"shadowmux server record key")?,
        server_length_key: hkdf.expand_key(b"shadowmux server length key")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_basic() {
        let ikm = b"input keying material";
        let hkdf = Hkdf::new(Some(b"salt"), ikm);

        let key1 = hkdf.expand_key(b"label1").unwrap();
        let key2 = hkdf.expand_key(b"label2").unwrap();

        // Different labels should produce different keys
        assert_ne!(key1, key2);

        // Same label should produce same key
        let key1_again = hkdf.expand_key(b"label1").unwrap();
        assert_eq!(key1, key1_again);
    }

    #[test]
    fn test_session_key_derivation() {
        let keys = derive_session_keys(&[0x42u8; 32]).unwrap();

        assert_ne!(keys.client_key, keys.server_key);
        assert_ne!(keys.client_key, keys.client_length_key);
        assert_ne!(keys.server_key, keys.server_length_key);
    }

    #[test]
    fn test_cipher_pairs_mirror() {
        let keys = derive_session_keys(&[7u8; 32]).unwrap();
        let suite = CipherSuite::ChaCha20Poly1305;
        let (mut client_tx, _client_rx) = keys.ciphers(suite, HandshakeRole::Initiator).unwrap();
        let (_server_tx, mut server_rx) = keys.ciphers(suite, HandshakeRole::Responder).unwrap();

        let mut buffer = b"upstream".to_vec();
        client_tx.seal_in_place(&mut buffer).unwrap();
        assert_eq!(server_rx.open_in_place(&mut buffer).unwrap(), b"upstream");
    }
}
