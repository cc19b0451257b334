//! Handshake admission control
//!
//! Each raw connection is judged exactly once from its first
//! `HANDSHAKE_LEN` bytes. A rejected connection never learns why; the caller
//! hands it to the decoy relay.

use crate::crypto::{CipherSuite, PrivateKey, SessionKeys};
use crate::protocol::{HandshakeMessage, Uid, EPHEMERAL_LEN, HANDSHAKE_LEN};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// What an admitted session may do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionMode {
    /// Streams go to the backend for the session's proxy method
    User,
    /// Streams go to the control backend
    Admin,
}

/// Why a connection was diverted to the decoy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Fewer bytes than a handshake arrived
    Truncated(usize),
    /// Noise decryption or payload decoding failed
    BadHandshake,
    /// Timestamp outside the accepted window (skew in seconds)
    StaleTimestamp(i64),
    /// Ephemeral key already used
    Replay,
    /// Identifier neither allow-listed nor administrative
    UnknownUser(Uid),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Truncated(n) => write!(f, "truncated handshake ({} bytes)", n),
            RejectReason::BadHandshake => f.write_str("handshake failed authentication"),
            RejectReason::StaleTimestamp(skew) => write!(f, "timestamp skew {}s", skew),
            RejectReason::Replay => f.write_str("replayed handshake"),
            RejectReason::UnknownUser(uid) => write!(f, "unknown user {:?}", uid),
        }
    }
}

/// An authenticated raw connection
pub struct Admitted {
    pub uid: Uid,
    pub mode: AdmissionMode,
    pub suite: CipherSuite,
    pub session_id: u32,
    pub proxy_method: String,
    pub keys: SessionKeys,
}

impl fmt::Debug for Admitted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admitted")
            .field("uid", &self.uid)
            .field("mode", &self.mode)
            .field("suite", &self.suite)
            .field("session_id", &self.session_id)
            .field("proxy_method", &self.proxy_method)
            .finish()
    }
}

/// Outcome of admission for one raw connection
#[derive(Debug)]
pub enum AdmissionDecision {
    Accept(Admitted),
    Reject(RejectReason),
}

/// Remembers handshake ephemerals for as long as their timestamp is valid
#[derive(Debug, Default)]
pub struct ReplayFilter {
    seen: HashMap<[u8; EPHEMERAL_LEN], u64>,
}

impl ReplayFilter {
    /// Record `ephemeral`; false if it was already present
    ///
    /// Entries older than `horizon` seconds before `now` are forgotten.
    pub fn check_and_insert(&mut self, ephemeral: [u8; EPHEMERAL_LEN], now: u64, horizon: u64) -> bool {
        let cutoff = now.saturating_sub(horizon);
        self.seen.retain(|_, seen_at| *seen_at >= cutoff);

        if self.seen.contains_key(&ephemeral) {
            return false;
        }
        self.seen.insert(ephemeral, now);
        true
    }

    /// Entries currently tracked
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// True if nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Decides whether a raw connection is a legitimate client
pub struct AdmissionControl {
    private_key: PrivateKey,
    users: HashSet<Uid>,
    admin_uid: Option<Uid>,
    timestamp_window: u64,
    replay: Mutex<ReplayFilter>,
}

impl AdmissionControl {
    /// Create admission control
    pub fn new(
        private_key: PrivateKey,
        users: HashSet<Uid>,
        admin_uid: Option<Uid>,
        timestamp_window: u64,
    ) -> Self {
        Self {
            private_key,
            users,
            admin_uid,
            timestamp_window,
            replay: Mutex::new(ReplayFilter::default()),
        }
    }

    /// Judge the first bytes of a raw connection against the current clock
    pub fn evaluate(&self, handshake: &[u8]) -> AdmissionDecision {
        self.evaluate_at(handshake, crate::protocol::unix_now())
    }

    /// Judge the first bytes of a raw connection at unix time `now`
    pub fn evaluate_at(&self, handshake: &[u8], now: u64) -> AdmissionDecision {
        if handshake.len() < HANDSHAKE_LEN {
            return AdmissionDecision::Reject(RejectReason::Truncated(handshake.len()));
        }

        let opened = match HandshakeMessage::open(&handshake[..HANDSHAKE_LEN], &self.private_key) {
            Ok(opened) => opened,
            Err(_) => return AdmissionDecision::Reject(RejectReason::BadHandshake),
        };
        let message = opened.message;

        let skew = message.timestamp as i64 - now as i64;
        if skew.unsigned_abs() > self.timestamp_window {
            return AdmissionDecision::Reject(RejectReason::StaleTimestamp(skew));
        }

        let mode = if self.admin_uid == Some(message.uid) {
            AdmissionMode::Admin
        } else if self.users.contains(&message.uid) {
            AdmissionMode::User
        } else {
            return AdmissionDecision::Reject(RejectReason::UnknownUser(message.uid));
        };

        // A replay can only be accepted while its timestamp is in the window
        let horizon = self.timestamp_window * 2;
        if !self
            .replay
            .lock()
            .check_and_insert(opened.ephemeral, now, horizon)
        {
            return AdmissionDecision::Reject(RejectReason::Replay);
        }

        AdmissionDecision::Accept(Admitted {
            uid: message.uid,
            mode,
            suite: message.suite,
            session_id: message.session_id,
            proxy_method: message.proxy_method,
            keys: opened.keys,
        })
    }
}
