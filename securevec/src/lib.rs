#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
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

//! A byte buffer which zeroes its memory on `.clear()`, `.resize()`,
//! reallocations and drop, to avoid copying secrets around.

use std::ops::{Deref, DerefMut};

use zeroize::Zeroize;

mod ssh;

/// A growable byte buffer whose contents are wiped before any memory is
/// handed back to the allocator.
///
/// Reallocation never happens in place: a larger buffer is allocated, the
/// contents are copied, and the old allocation is zeroed before it is freed.
pub struct SecureVec {
    buf: Vec<u8>,
}

impl SecureVec {
    /// Create an empty buffer.
    pub const fn new() -> Self {
        SecureVec { buf: Vec::new() }
    }

    /// Create a buffer of length `len`, initialised to zero.
    pub fn new_zeroed(len: usize) -> Self {
        SecureVec { buf: vec![0; len] }
    }

    /// Create an empty buffer with room for `cap` bytes.
    pub fn with_capacity(cap: usize) -> Self {
        SecureVec {
            buf: Vec::with_capacity(cap),
        }
    }

    /// Copy `slice` into a fresh buffer.
    pub fn from_slice(slice: &[u8]) -> Self {
        let mut v = SecureVec::with_capacity(slice.len());
        v.extend(slice);
        v
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Set the length to 0, zeroing the previous contents. The allocation is
    /// kept for reuse.
    pub fn clear(&mut self) {
        self.buf.zeroize();
        self.buf.clear();
    }

    pub fn push(&mut self, b: u8) {
        self.reserve(1);
        self.buf.push(b)
    }

    /// Append `slice` to the buffer.
    pub fn extend(&mut self, slice: &[u8]) {
        self.reserve(slice.len());
        self.buf.extend_from_slice(slice)
    }

    /// Resize to `size` bytes. Grows with zeros; shrinking zeroes the
    /// abandoned tail first.
    pub fn resize(&mut self, size: usize) {
        if size < self.buf.len() {
            if let Some(tail) = self.buf.get_mut(size..) {
                tail.zeroize();
            }
            self.buf.truncate(size);
        } else {
            self.reserve(size - self.buf.len());
            self.buf.resize(size, 0);
        }
    }

    /// Append `n` zero bytes and return the newly added span.
    pub fn resize_mut(&mut self, n: usize) -> &mut [u8] {
        let old = self.buf.len();
        self.resize(old + n);
        #[allow(clippy::indexing_slicing)] // just resized
        &mut self.buf[old..]
    }

    /// Ensure room for `additional` more bytes. Growth goes through a fresh
    /// allocation so the old one can be wiped.
    pub fn reserve(&mut self, additional: usize) {
        let needed = self.buf.len() + additional;
        if needed <= self.buf.capacity() {
            return;
        }
        let new_cap = needed.max(self.buf.capacity() * 2).max(64);
        let mut new_buf = Vec::with_capacity(new_cap);
        new_buf.extend_from_slice(&self.buf);
        self.buf.zeroize();
        self.buf = new_buf;
    }
}

impl Drop for SecureVec {
    fn drop(&mut self) {
        self.buf.zeroize();
    }
}

impl Default for SecureVec {
    fn default() -> Self {
        SecureVec::new()
    }
}

impl Clone for SecureVec {
    fn clone(&self) -> Self {
        SecureVec::from_slice(&self.buf)
    }
}

impl std::fmt::Debug for SecureVec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureVec({} bytes)", self.buf.len())
    }
}

impl PartialEq for SecureVec {
    fn eq(&self, other: &Self) -> bool {
        self.buf == other.buf
    }
}

impl Eq for SecureVec {}

impl Deref for SecureVec {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for SecureVec {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl AsRef<[u8]> for SecureVec {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl AsMut<[u8]> for SecureVec {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl From<Vec<u8>> for SecureVec {
    fn from(mut v: Vec<u8>) -> Self {
        let s = SecureVec::from_slice(&v);
        v.zeroize();
        s
    }
}

impl From<String> for SecureVec {
    fn from(s: String) -> Self {
        SecureVec::from(s.into_bytes())
    }
}

impl std::io::Write for SecureVec {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        self.extend(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> Result<(), std::io::Error> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn resize_zeroes_the_tail() {
        let mut v = SecureVec::from_slice(b"secret material");
        v.resize(6);
        assert_eq!(&v[..], b"secret");
        v.resize(10);
        assert_eq!(&v[..], b"secret\0\0\0\0");
    }

    #[test]
    fn resize_mut_returns_the_new_span() {
        let mut v = SecureVec::from_slice(b"abc");
        {
            let span = v.resize_mut(2);
            assert_eq!(span.len(), 2);
            span.copy_from_slice(b"de");
        }
        assert_eq!(&v[..], b"abcde");
    }

    #[test]
    fn growth_preserves_contents() {
        let mut v = SecureVec::new();
        for i in 0..1000u32 {
            v.extend(&i.to_be_bytes());
        }
        assert_eq!(v.len(), 4000);
        assert_eq!(&v[0..4], &[0, 0, 0, 0]);
        assert_eq!(&v[3996..4000], &999u32.to_be_bytes());
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut v = SecureVec::from_slice(&[1u8; 256]);
        let cap = v.capacity();
        v.clear();
        assert!(v.is_empty());
        assert_eq!(v.capacity(), cap);
    }
}
