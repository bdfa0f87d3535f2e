// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//! Buffers the transport reads into and decodes out of: fixed-size segments
//! drawn from a shared pool, linked into per-connection staging sequences,
//! plus the pooled payload buffers decoded packets own.

use std::collections::VecDeque;
use std::num::Wrapping;
use std::ops::{Deref, Range};
use std::sync::{Arc, Mutex};

use securevec::SecureVec;
use zeroize::Zeroize;

pub(crate) const SEGMENT_SIZE: usize = 4096;

/// A multi-producer pool of fixed-size segments. Segments are zeroed before
/// they go back on the free list.
pub(crate) struct SegmentPool {
    free: Mutex<Vec<Box<[u8]>>>,
}

impl SegmentPool {
    pub fn new() -> Arc<Self> {
        Arc::new(SegmentPool {
            free: Mutex::new(Vec::new()),
        })
    }

    fn take(&self) -> Box<[u8]> {
        let recycled = self.free.lock().ok().and_then(|mut f| f.pop());
        recycled.unwrap_or_else(|| vec![0u8; SEGMENT_SIZE].into_boxed_slice())
    }

    fn put(&self, mut seg: Box<[u8]>) {
        seg.zeroize();
        if let Ok(mut free) = self.free.lock() {
            free.push(seg);
        }
    }

    #[cfg(test)]
    pub(crate) fn free_segments(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}

/// An ordered sequence of pooled segments with a read cursor at the front
/// and a write cursor at the back. Single-owner; only the pool is shared.
pub(crate) struct Sequence {
    pool: Arc<SegmentPool>,
    segs: VecDeque<Box<[u8]>>,
    /// Read offset into the first segment.
    head: usize,
    /// Fill level of the last segment.
    tail: usize,
}

impl Sequence {
    pub fn new(pool: Arc<SegmentPool>) -> Self {
        Sequence {
            pool,
            segs: VecDeque::new(),
            head: 0,
            tail: 0,
        }
    }

    pub fn len(&self) -> usize {
        match self.segs.len() {
            0 => 0,
            n => n * SEGMENT_SIZE - self.head - (SEGMENT_SIZE - self.tail),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Uncommitted writable space at the back, linking a fresh segment when
    /// the current one is full. Pair with [`Sequence::commit`].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        if self.segs.is_empty() || self.tail == SEGMENT_SIZE {
            let seg = self.pool.take();
            self.segs.push_back(seg);
            self.tail = 0;
        }
        let tail = self.tail;
        #[allow(clippy::unwrap_used, clippy::indexing_slicing)] // non-empty, tail < SEGMENT_SIZE
        &mut self.segs.back_mut().unwrap()[tail..]
    }

    /// Mark `n` bytes of the span returned by [`Sequence::spare_mut`] as
    /// filled.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.tail + n <= SEGMENT_SIZE);
        self.tail += n;
    }

    pub fn extend(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let span = self.spare_mut();
            let n = span.len().min(data.len());
            #[allow(clippy::indexing_slicing)] // n bounded by both lengths
            span[..n].copy_from_slice(&data[..n]);
            self.commit(n);
            data = data.get(n..).unwrap_or_default();
        }
    }

    /// Iterate the filled spans in order.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let last = self.segs.len().saturating_sub(1);
        self.segs.iter().enumerate().map(move |(i, seg)| {
            let start = if i == 0 { self.head } else { 0 };
            let end = if i == last { self.tail } else { SEGMENT_SIZE };
            seg.get(start..end).unwrap_or_default()
        })
    }

    /// Copy the first `out.len()` bytes into `out` without consuming them.
    /// Returns false if the sequence is shorter than `out`.
    pub fn peek(&self, out: &mut [u8]) -> bool {
        if self.len() < out.len() {
            return false;
        }
        let mut filled = 0;
        for span in self.segments() {
            if filled == out.len() {
                break;
            }
            let n = span.len().min(out.len() - filled);
            #[allow(clippy::indexing_slicing)] // n bounded by both lengths
            out[filled..filled + n].copy_from_slice(&span[..n]);
            filled += n;
        }
        true
    }

    /// Append the first `n` bytes to `out` without consuming them. The
    /// caller has already checked `self.len() >= n`.
    pub fn copy_out(&self, mut n: usize, out: &mut SecureVec) {
        debug_assert!(self.len() >= n);
        for span in self.segments() {
            if n == 0 {
                break;
            }
            let take = span.len().min(n);
            out.extend(span.get(..take).unwrap_or_default());
            n -= take;
        }
    }

    /// Drop `n` bytes from the front, releasing emptied segments back to
    /// the pool.
    pub fn remove(&mut self, mut n: usize) {
        debug_assert!(self.len() >= n);
        while n > 0 {
            let span = if self.segs.len() == 1 {
                self.tail - self.head
            } else {
                SEGMENT_SIZE - self.head
            };
            if n < span {
                self.head += n;
                return;
            }
            n -= span;
            if let Some(seg) = self.segs.pop_front() {
                self.pool.put(seg);
            }
            self.head = 0;
            if self.segs.is_empty() {
                self.tail = 0;
            }
        }
    }

    pub fn clear(&mut self) {
        let len = self.len();
        self.remove(len);
    }
}

impl Drop for Sequence {
    fn drop(&mut self) {
        while let Some(seg) = self.segs.pop_front() {
            self.pool.put(seg);
        }
    }
}

/// Recycles the contiguous buffers decoded packets are carried in.
pub(crate) struct BufPool {
    free: Mutex<Vec<SecureVec>>,
}

impl BufPool {
    pub fn new() -> Arc<Self> {
        Arc::new(BufPool {
            free: Mutex::new(Vec::new()),
        })
    }

    pub fn take(&self) -> SecureVec {
        let recycled = self.free.lock().ok().and_then(|mut f| f.pop());
        recycled.unwrap_or_default()
    }

    pub fn put(&self, mut buf: SecureVec) {
        buf.clear();
        if let Ok(mut free) = self.free.lock() {
            free.push(buf);
        }
    }
}

/// A decoded packet. Owns its (pooled) buffer; dropping the packet zeroes
/// the plaintext and hands the buffer back to the pool.
pub struct Packet {
    pool: Arc<BufPool>,
    buf: Option<SecureVec>,
    payload: Range<usize>,
}

impl Packet {
    pub(crate) fn new(pool: Arc<BufPool>, buf: SecureVec, payload: Range<usize>) -> Self {
        debug_assert!(payload.end <= buf.len());
        Packet {
            pool,
            buf: Some(buf),
            payload,
        }
    }

    pub fn payload(&self) -> &[u8] {
        self.buf
            .as_ref()
            .and_then(|b| b.get(self.payload.clone()))
            .unwrap_or_default()
    }

    /// The message id, if the payload is non-empty.
    pub fn msg_id(&self) -> Option<u8> {
        self.payload().first().copied()
    }
}

impl Deref for Packet {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.payload()
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Packet({} bytes, msg {:?})",
            self.payload().len(),
            self.msg_id()
        )
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

/// Per-direction packet accounting: the wrapping 32-bit sequence number
/// (https://tools.ietf.org/html/rfc4253#section-6.4) plus the byte and
/// packet counts the rekey thresholds watch.
#[derive(Debug, Default)]
pub(crate) struct StreamCounters {
    pub seqn: Wrapping<u32>,
    pub bytes: u64,
    pub packets: u64,
}

impl StreamCounters {
    pub fn advance(&mut self, frame_len: usize) {
        self.seqn += Wrapping(1);
        self.bytes += frame_len as u64;
        self.packets += 1;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn spare_commit_and_peek() {
        let pool = SegmentPool::new();
        let mut seq = Sequence::new(pool);
        let span = seq.spare_mut();
        span[0] = 0xab;
        span[1] = 0xcd;
        seq.commit(2);
        assert_eq!(seq.len(), 2);

        let mut out = [0u8; 2];
        assert!(seq.peek(&mut out));
        assert_eq!(out, [0xab, 0xcd]);
        assert_eq!(seq.len(), 2, "peek must not consume");

        let mut big = [0u8; 3];
        assert!(!seq.peek(&mut big));
    }

    #[test]
    fn remove_spans_segments_and_recycles() {
        let pool = SegmentPool::new();
        let mut seq = Sequence::new(pool.clone());
        let data: Vec<u8> = (0..(SEGMENT_SIZE * 2 + 100)).map(|i| i as u8).collect();
        seq.extend(&data);
        assert_eq!(seq.len(), data.len());

        seq.remove(SEGMENT_SIZE + 1);
        assert_eq!(seq.len(), SEGMENT_SIZE + 99);
        assert_eq!(pool.free_segments(), 1);

        let mut head = [0u8; 4];
        assert!(seq.peek(&mut head));
        let expected: Vec<u8> = (0..4u32)
            .map(|i| (SEGMENT_SIZE + 1 + i as usize) as u8)
            .collect();
        assert_eq!(&head[..], &expected[..]);

        seq.clear();
        assert!(seq.is_empty());
        assert_eq!(pool.free_segments(), 3);
    }

    #[test]
    fn copy_out_crosses_segment_boundaries() {
        let pool = SegmentPool::new();
        let mut seq = Sequence::new(pool);
        let data: Vec<u8> = (0..(SEGMENT_SIZE + 10)).map(|i| (i % 251) as u8).collect();
        seq.extend(&data);

        let mut out = SecureVec::new();
        seq.copy_out(data.len(), &mut out);
        assert_eq!(&out[..], &data[..]);
        assert_eq!(seq.len(), data.len(), "copy_out must not consume");
    }

    #[test]
    fn dropping_a_sequence_returns_segments() {
        let pool = SegmentPool::new();
        {
            let mut seq = Sequence::new(pool.clone());
            seq.extend(&[0u8; SEGMENT_SIZE + 1]);
        }
        assert_eq!(pool.free_segments(), 2);
    }

    #[test]
    fn packet_buffer_is_pooled_on_drop() {
        let pool = BufPool::new();
        let mut buf = pool.take();
        buf.extend(b"\x05payload");
        drop(Packet::new(pool.clone(), buf, 1..8));
        let recycled = pool.take();
        assert!(recycled.is_empty());
    }
}
