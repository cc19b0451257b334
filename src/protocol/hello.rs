//! Handshake message encoding
//!
//! Wire layout (Noise N initiator message):
//! ```text
//! +----------------+--------------------------------------+--------+
//! | ephemeral (32) | sealed payload (41)                  | tag 16 |
//! +----------------+--------------------------------------+--------+
//!
//! payload: uid (16) | proxy method (12) | suite (1) | session id (4) | timestamp (8)
//! ```

use super::{
    ProtocolError, EPHEMERAL_LEN, HANDSHAKE_LEN, HANDSHAKE_PAYLOAD_LEN, METHOD_LEN, UID_LEN,
};
use crate::crypto::{
    derive_session_keys, CipherSuite, NoiseHandshake, PrivateKey, PublicKey, SessionKeys,
};
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

/// Fixed-width user identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uid(pub [u8; UID_LEN]);

impl Uid {
    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, ProtocolError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| ProtocolError::InvalidUid(e.to_string()))?;
        let arr: [u8; UID_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::InvalidUid(format!("expected {} bytes", UID_LEN)))?;
        Ok(Self(arr))
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Random identifier
    pub fn generate() -> Self {
        let mut uid = [0u8; UID_LEN];
        crate::crypto::random_bytes(&mut uid);
        Self(uid)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// Client hello carried inside the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub uid: Uid,
    pub proxy_method: String,
    pub suite: CipherSuite,
    /// Raw connections presenting the same (uid, session_id) join one session
    pub session_id: u32,
    pub timestamp: u64,
}

/// Result of a successfully authenticated handshake
pub struct OpenedHandshake {
    pub message: HandshakeMessage,
    /// Client ephemeral key, used for replay detection
    pub ephemeral: [u8; EPHEMERAL_LEN],
    pub keys: SessionKeys,
}

impl HandshakeMessage {
    fn encode_payload(&self) -> Result<BytesMut, ProtocolError> {
        let method = self.proxy_method.as_bytes();
        if method.len() > METHOD_LEN {
            return Err(ProtocolError::MethodTooLong(method.len()));
        }

        let mut buf = BytesMut::with_capacity(HANDSHAKE_PAYLOAD_LEN);
        buf.put_slice(&self.uid.0);
        buf.put_slice(method);
        buf.put_bytes(0, METHOD_LEN - method.len());
        buf.put_u8(self.suite.selector());
        buf.put_u32(self.session_id);
        buf.put_u64(self.timestamp);
        Ok(buf)
    }

    fn decode_payload(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != HANDSHAKE_PAYLOAD_LEN {
            return Err(ProtocolError::InvalidLength(buf.len()));
        }

        let mut uid = [0u8; UID_LEN];
        buf.copy_to_slice(&mut uid);

        let mut method = [0u8; METHOD_LEN];
        buf.copy_to_slice(&mut method);
        let end = method.iter().position(|&b| b == 0).unwrap_or(METHOD_LEN);
        let proxy_method = std::str::from_utf8(&method[..end])
            .map_err(|_| ProtocolError::InvalidMethod)?
            .to_string();

        let selector = buf.get_u8();
        let suite =
            CipherSuite::from_selector(selector).ok_or(ProtocolError::UnknownSuite(selector))?;

        Ok(Self {
            uid: Uid(uid),
            proxy_method,
            suite,
            session_id: buf.get_u32(),
            timestamp: buf.get_u64(),
        })
    }

    /// Seal the hello for `server_public`
    ///
    /// Returns the wire bytes and the derived record keys.
    pub fn seal(&self, server_public: &PublicKey) -> crate::Result<(Vec<u8>, SessionKeys)> {
        let payload = self.encode_payload()?;
        let mut handshake = NoiseHandshake::new_initiator(server_public)?;

        let mut message = vec![0u8; HANDSHAKE_LEN];
        let len = handshake.write_message(&payload, &mut message)?;
        if len != HANDSHAKE_LEN {
            return Err(ProtocolError::InvalidLength(len).into());
        }

        let keys = derive_session_keys(&handshake.handshake_hash()?)?;
        Ok((message, keys))
    }

    /// Authenticate and decode a hello with the server's static key
    pub fn open(message: &[u8], server_private: &PrivateKey) -> crate::Result<OpenedHandshake> {
        if message.len() != HANDSHAKE_LEN {
            return Err(ProtocolError::InvalidLength(message.len()).into());
        }

        let mut handshake = NoiseHandshake::new_responder(server_private)?;
        let mut payload = [0u8; HANDSHAKE_LEN];
        let n = handshake.read_message(message, &mut payload)?;
        let decoded = Self::decode_payload(&payload[..n])?;

        let mut ephemeral = [0u8; EPHEMERAL_LEN];
        ephemeral.copy_from_slice(&message[..EPHEMERAL_LEN]);

        Ok(OpenedHandshake {
            message: decoded,
            ephemeral,
            keys: derive_session_keys(&handshake.handshake_hash()?)?,
        })
    }
}
