//! Per-stream reorder buffer
//!
//! Frames of one stream may be dispatched over different raw connections and
//! arrive out of order. The buffer releases them strictly by sequence number.

use super::{Frame, TunnelError, REORDER_WINDOW};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Holds out-of-order frames until the gap before them fills
#[derive(Debug)]
pub struct ReorderBuffer {
    /// Sequence number of `window[0]`
    next_seq: u64,
    window: VecDeque<Option<Frame>>,
    buffered_bytes: usize,
    byte_limit: usize,
    /// When the current head gap opened
    gap_since: Option<Instant>,
}

impl ReorderBuffer {
    /// Create a buffer expecting sequence 0 first
    pub fn new(byte_limit: usize) -> Self {
        Self {
            next_seq: 0,
            window: VecDeque::new(),
            buffered_bytes: 0,
            byte_limit,
            gap_since: None,
        }
    }

    /// Insert a received frame
    ///
    /// Duplicates, frames behind the window and buffer overflow are protocol
    /// violations.
    pub fn insert(&mut self, frame: Frame) -> Result<(), TunnelError> {
        if frame.seq < self.next_seq {
            return Err(TunnelError::Protocol(format!(
                "Stream {} replayed sequence {} (expecting {})",
                frame.stream_id, frame.seq, self.next_seq
            )));
        }

        let offset = frame.seq - self.next_seq;
        if offset >= REORDER_WINDOW {
            return Err(TunnelError::Protocol(format!(
                "Stream {} sequence {} outside reorder window",
                frame.stream_id, frame.seq
            )));
        }
        let offset = offset as usize;

        let size = frame.payload.len();
        if offset > 0 && self.buffered_bytes + size > self.byte_limit {
            return Err(TunnelError::Protocol(format!(
                "Stream {} reorder buffer overflow",
                frame.stream_id
            )));
        }

        if self.window.len() <= offset {
            self.window.resize_with(offset + 1, || None);
        }
        let slot = &mut self.window[offset];
        if slot.is_some() {
            return Err(TunnelError::Protocol(format!(
                "Stream {} duplicate sequence {}",
                frame.stream_id, frame.seq
            )));
        }
        *slot = Some(frame);
        self.buffered_bytes += size;

        if offset > 0 && self.gap_since.is_none() {
            self.gap_since = Some(Instant::now());
        }
        Ok(())
    }

    /// Release the next in-order frame, if present
    pub fn pop_ready(&mut self) -> Option<Frame> {
        match self.window.front() {
            Some(Some(_)) => {}
            _ => return None,
        }
        let frame = self.window.pop_front().flatten()?;
        self.buffered_bytes -= frame.payload.len();
        self.next_seq += 1;

        self.gap_since = match self.window.front() {
            None => None,
            Some(Some(_)) => None,
            Some(None) => Some(Instant::now()),
        };
        Some(frame)
    }

    /// How long the head-of-line gap has been open
    pub fn gap_age(&self, now: Instant) -> Option<Duration> {
        self.gap_since.map(|since| now.saturating_duration_since(since))
    }

    /// Next sequence number the buffer will release
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Payload bytes currently held
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// True if no frame is waiting
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
