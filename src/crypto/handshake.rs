//! Noise Protocol handshake implementation
//!
//! Uses the N pattern:
//! - Client knows server's static public key (prevents active probing)
//! - A single client → server message, so the server never answers a
//!   connection it cannot authenticate
//! - Forward secrecy for the client via its ephemeral key

use super::{CryptoError, PrivateKey, PublicKey, NOISE_PATTERN};
use snow::params::NoiseParams;
use snow::{Builder, HandshakeState};

/// Role in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Initiator (client)
    Initiator,
    /// Responder (server)
    Responder,
}

/// Noise Protocol handshake state machine
pub struct NoiseHandshake {
    state: HandshakeState,
}

fn params() -> Result<NoiseParams, CryptoError> {
    NOISE_PATTERN.parse().map_err(CryptoError::Noise)
}

impl NoiseHandshake {
    /// Create a new initiator (client) handshake
    ///
    /// # Arguments
    /// * `remote_public` - Server's known public key (critical for anti-probing)
    pub fn new_initiator(remote_public: &PublicKey) -> Result<Self, CryptoError> {
        let state = Builder::new(params()?)
            .remote_public_key(remote_public.as_bytes())
            .build_initiator()
            .map_err(CryptoError::Noise)?;

        Ok(Self { state })
    }

    /// Create a new responder (server) handshake
    ///
    /// # Arguments
    /// * `local_private` - Server's static private key
    pub fn new_responder(local_private: &PrivateKey) -> Result<Self, CryptoError> {
        let state = Builder::new(params()?)
            .local_private_key(local_private.as_bytes())
            .build_responder()
            .map_err(CryptoError::Noise)?;

        Ok(Self { state })
    }

    /// Check if handshake is complete
    pub fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// Write the handshake message carrying `payload`
    ///
    /// # Returns
    /// Number of bytes written to `output`
    pub fn write_message(
        &mut self,
        payload: &[u8],
        output: &mut [u8],
    ) -> Result<usize, CryptoError> {
        self.state
            .write_message(payload, output)
            .map_err(CryptoError::Noise)
    }

    /// Read and authenticate the handshake message
    ///
    /// # Returns
    /// Number of payload bytes written to `payload`
    pub fn read_message(
        &mut self,
        message: &[u8],
        payload: &mut [u8],
    ) -> Result<usize, CryptoError> {
        self.state
            .read_message(message, payload)
            .map_err(CryptoError::Noise)
    }

    /// Handshake transcript hash, identical on both sides once finished
    pub fn handshake_hash(&self) -> Result<Vec<u8>, CryptoError> {
        if !self.is_finished() {
            return Err(CryptoError::Handshake(
                "Handshake not complete".to_string(),
            ));
        }
        Ok(self.state.get_handshake_hash().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_handshake_n_pattern() {
        let server_keypair = KeyPair::generate().unwrap();

        let mut client = NoiseHandshake::new_initiator(&server_keypair.public).unwrap();
        let mut server = NoiseHandshake::new_responder(&server_keypair.private).unwrap();

        let mut message = [0u8; 256];
        let mut payload = [0u8; 256];

        // N pattern: -> e, es
        let len = client.write_message(b"hello", &mut message).unwrap();
        let n = server.read_message(&message[..len], &mut payload).unwrap();

        assert_eq!(&payload[..n], b"hello");
        assert!(client.is_finished());
        assert!(server.is_finished());
        assert_eq!(
            client.handshake_hash().unwrap(),
            server.handshake_hash().unwrap()
        );
    }

    #[test]
    fn test_wrong_server_key_rejected() {
        let server_keypair = KeyPair::generate().unwrap();
        let other_keypair = KeyPair::generate().unwrap();

        let mut client = NoiseHandshake::new_initiator(&other_keypair.public).unwrap();
        let mut server = NoiseHandshake::new_responder(&server_keypair.private).unwrap();

        let mut message = [0u8; 256];
        let mut payload = [0u8; 256];
        let len = client.write_message(b"hello", &mut message).unwrap();

        assert!(server.read_message(&message[..len], &mut payload).is_err());
        assert!(server.handshake_hash().is_err());
    }
}
