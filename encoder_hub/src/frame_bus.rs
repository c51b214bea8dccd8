//! Latest-wins frame slots. Each slot holds exactly one payload; a publish
//! replaces it whole, a snapshot copies it whole. Readers can skip
//! sequence numbers but can never observe a torn payload.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use log::warn;
use std::sync::Mutex;
use std::time::Instant;

pub const JPEG_SLOT_MAX: usize = 512 * 1024;
pub const H264_SLOT_MAX: usize = 256 * 1024;

struct SlotInner {
    payload: Vec<u8>,
    len: usize,
    seq: u64,
    ts_ms: u64,
    ready: bool,
}

/// Single-producer / many-consumer latest-value register.
pub struct FrameSlot {
    name: &'static str,
    max_len: usize,
    inner: Mutex<SlotInner>,
}

impl FrameSlot {
    pub fn new(name: &'static str, max_len: usize) -> Self {
        Self {
            name,
            max_len,
            inner: Mutex::new(SlotInner {
                payload: Vec::new(),
                len: 0,
                seq: 0,
                ts_ms: 0,
                ready: false,
            }),
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Replaces the slot content. Never blocks beyond the memcpy critical
    /// section; an oversized payload is dropped with a diagnostic and the
    /// previous content stays observable.
    pub fn publish(&self, payload: &[u8], ts_ms: u64) {
        if payload.len() > self.max_len {
            warn!(
                "{} slot: dropping oversized payload ({} > {} bytes)",
                self.name,
                payload.len(),
                self.max_len
            );
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.payload.clear();
        inner.payload.extend_from_slice(payload);
        inner.len = payload.len();
        inner.seq += 1;
        inner.ts_ms = ts_ms;
        inner.ready = true;
    }

    /// Copies the current payload into `out` (cleared first). `None` until
    /// the first publish.
    pub fn snapshot(&self, out: &mut Vec<u8>) -> Option<(u64, u64)> {
        let inner = self.inner.lock().unwrap();
        if !inner.ready {
            return None;
        }
        out.clear();
        out.extend_from_slice(&inner.payload[..inner.len]);
        Some((inner.seq, inner.ts_ms))
    }

    /// Sequence number of the latest publish without copying the payload.
    pub fn seq(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        if inner.ready {
            inner.seq
        } else {
            0
        }
    }
}

/// The three process-wide slots plus the shared process clock.
pub struct FrameBus {
    pub jpeg: FrameSlot,
    pub h264: FrameSlot,
    pub fd_source: FrameSlot,
    started: Instant,
}

impl FrameBus {
    pub fn new() -> Self {
        Self {
            jpeg: FrameSlot::new("jpeg", JPEG_SLOT_MAX),
            h264: FrameSlot::new("h264", H264_SLOT_MAX),
            fd_source: FrameSlot::new("fd_source", JPEG_SLOT_MAX),
            started: Instant::now(),
        }
    }

    /// Milliseconds since process start; the timestamp domain of every slot.
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_until_first_publish() {
        let slot = FrameSlot::new("t", 64);
        let mut out = Vec::new();
        assert!(slot.snapshot(&mut out).is_none());
        assert_eq!(slot.seq(), 0);
    }

    #[test]
    fn publish_then_snapshot_round_trips() {
        let slot = FrameSlot::new("t", 64);
        slot.publish(b"abc", 17);
        let mut out = Vec::new();
        let (seq, ts) = slot.snapshot(&mut out).unwrap();
        assert_eq!((seq, ts), (1, 17));
        assert_eq!(out, b"abc");

        slot.publish(b"defg", 18);
        let (seq, _) = slot.snapshot(&mut out).unwrap();
        assert_eq!(seq, 2);
        assert_eq!(out, b"defg");
    }

    #[test]
    fn oversized_publish_is_dropped_whole() {
        let slot = FrameSlot::new("t", 4);
        slot.publish(b"ok", 1);
        slot.publish(b"way too large", 2);
        let mut out = Vec::new();
        let (seq, ts) = slot.snapshot(&mut out).unwrap();
        assert_eq!((seq, ts), (1, 1));
        assert_eq!(out, b"ok");
    }

    #[test]
    fn same_seq_means_same_bytes() {
        let slot = FrameSlot::new("t", 64);
        slot.publish(b"first", 1);
        let mut a = Vec::new();
        let mut b = Vec::new();
        let (s1, _) = slot.snapshot(&mut a).unwrap();
        let (s2, _) = slot.snapshot(&mut b).unwrap();
        assert_eq!(s1, s2);
        assert_eq!(a, b);
    }

    #[test]
    fn sequence_strictly_increases_across_threads() {
        let slot = Arc::new(FrameSlot::new("t", 64));
        let writer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                for i in 0..500u64 {
                    slot.publish(&i.to_le_bytes(), i);
                }
            })
        };
        let reader = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let mut last = 0u64;
                let mut out = Vec::new();
                for _ in 0..500 {
                    if let Some((seq, _)) = slot.snapshot(&mut out) {
                        // Monotonic, possibly skipping; payload always whole.
                        assert!(seq >= last);
                        assert_eq!(out.len(), 8);
                        last = seq;
                    }
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(slot.seq(), 500);
    }
}
