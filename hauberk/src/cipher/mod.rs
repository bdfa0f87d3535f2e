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
//!
//! This module exports cipher names for use with [Preferred][crate::Preferred],
//! and implements the packet codec family behind them.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock};

use aes::{Aes128, Aes192, Aes256};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use byteorder::{BigEndian, ByteOrder};
use ctr::Ctr128BE;
use delegate::delegate;
use log::trace;
use ssh_encoding::Encode;

use crate::mac::MacAlgorithm;
use crate::sshbuf::{BufPool, Packet, Sequence, StreamCounters};
use crate::{Error, SecureVec};

pub(crate) mod block;
pub(crate) mod chacha20poly1305;
pub(crate) mod clear;
pub(crate) mod gcm;

use block::SshBlockCipher;
use chacha20poly1305::SshChacha20Poly1305Cipher;
use clear::Clear;
use gcm::GcmCipher;

pub(crate) trait Cipher {
    fn needs_mac(&self) -> bool {
        false
    }
    fn key_len(&self) -> usize;
    fn iv_len(&self) -> usize {
        0
    }
    fn make_opening_key(
        &self,
        key: &[u8],
        iv: &[u8],
        mac_key: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Box<dyn OpeningKey + Send>;
    fn make_sealing_key(
        &self,
        key: &[u8],
        iv: &[u8],
        mac_key: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Box<dyn SealingKey + Send>;
}

/// `none`
pub const NONE: Name = Name("none");
/// `aes128-ctr`
pub const AES_128_CTR: Name = Name("aes128-ctr");
/// `aes192-ctr`
pub const AES_192_CTR: Name = Name("aes192-ctr");
/// `aes256-ctr`
pub const AES_256_CTR: Name = Name("aes256-ctr");
/// `aes128-gcm@openssh.com`
pub const AES_128_GCM: Name = Name("aes128-gcm@openssh.com");
/// `aes256-gcm@openssh.com`
pub const AES_256_GCM: Name = Name("aes256-gcm@openssh.com");
/// `chacha20-poly1305@openssh.com`
pub const CHACHA20_POLY1305: Name = Name("chacha20-poly1305@openssh.com");

pub(crate) static _CLEAR: Clear = Clear {};
static _AES_128_CTR: SshBlockCipher<Ctr128BE<Aes128>> = SshBlockCipher(PhantomData);
static _AES_192_CTR: SshBlockCipher<Ctr128BE<Aes192>> = SshBlockCipher(PhantomData);
static _AES_256_CTR: SshBlockCipher<Ctr128BE<Aes256>> = SshBlockCipher(PhantomData);
static _AES_128_GCM: GcmCipher<Aes128Gcm> = GcmCipher(PhantomData);
static _AES_256_GCM: GcmCipher<Aes256Gcm> = GcmCipher(PhantomData);
static _CHACHA20_POLY1305: SshChacha20Poly1305Cipher = SshChacha20Poly1305Cipher {};

pub static ALL_CIPHERS: &[&Name] = &[
    &NONE,
    &AES_128_CTR,
    &AES_192_CTR,
    &AES_256_CTR,
    &AES_128_GCM,
    &AES_256_GCM,
    &CHACHA20_POLY1305,
];

pub(crate) static CIPHERS: LazyLock<HashMap<&'static Name, &(dyn Cipher + Send + Sync)>> =
    LazyLock::new(|| {
        let mut h: HashMap<&'static Name, &(dyn Cipher + Send + Sync)> = HashMap::new();
        h.insert(&NONE, &_CLEAR);
        h.insert(&AES_128_CTR, &_AES_128_CTR);
        h.insert(&AES_192_CTR, &_AES_192_CTR);
        h.insert(&AES_256_CTR, &_AES_256_CTR);
        h.insert(&AES_128_GCM, &_AES_128_GCM);
        h.insert(&AES_256_GCM, &_AES_256_GCM);
        h.insert(&CHACHA20_POLY1305, &_CHACHA20_POLY1305);
        assert_eq!(h.len(), ALL_CIPHERS.len());
        h
    });

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Name(&'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

impl Encode for Name {
    delegate! { to self.as_ref() {
        fn encoded_len(&self) -> Result<usize, ssh_encoding::Error>;
        fn encode(&self, writer: &mut impl ssh_encoding::Writer) -> Result<(), ssh_encoding::Error>;
    }}
}

impl Borrow<str> for &Name {
    fn borrow(&self) -> &str {
        self.0
    }
}

impl TryFrom<&str> for Name {
    type Error = ();
    fn try_from(s: &str) -> Result<Name, ()> {
        CIPHERS.keys().find(|x| x.0 == s).map(|x| **x).ok_or(())
    }
}

/// One direction's sealing key and the other direction's opening key,
/// replaced together at NEWKEYS.
pub(crate) struct CipherPair {
    pub local_to_remote: Box<dyn SealingKey + Send>,
    pub remote_to_local: Box<dyn OpeningKey + Send>,
}

impl Debug for CipherPair {
    fn fmt(&self, _: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        Ok(())
    }
}

pub(crate) trait OpeningKey {
    /// Peek at the packet length without advancing any cipher state.
    fn decrypt_packet_length(&self, seqn: u32, encrypted_packet_length: [u8; 4]) -> [u8; 4];

    /// Whether `length` satisfies this cipher's block alignment.
    fn check_length(&self, _length: usize) -> bool {
        true
    }

    fn tag_len(&self) -> usize;

    /// Verify and decrypt one frame in place. `frame` holds the 4 length
    /// bytes, the (encrypted) body and the trailing tag; on success
    /// `frame[4]` is the padding length and the body up to the tag is
    /// plaintext.
    fn open(&mut self, seqn: u32, frame: &mut [u8]) -> Result<(), Error>;
}

pub(crate) trait SealingKey {
    fn padding_length(&self, payload: &[u8]) -> usize;

    fn fill_padding(&self, padding_out: &mut [u8]);

    fn tag_len(&self) -> usize;

    fn seal(&mut self, seqn: u32, plaintext_in_ciphertext_out: &mut [u8], tag_out: &mut [u8]);

    /// Frame and seal one payload onto `buffer`, advancing the sequence
    /// number and the rekey byte counters.
    fn write(&mut self, payload: &[u8], counters: &mut StreamCounters, buffer: &mut SecureVec) {
        // https://tools.ietf.org/html/rfc4253#section-6
        //
        // The variables `payload`, `packet_length` and `padding_length`
        // refer to the protocol fields of the same names.
        trace!("writing, seqn = {:?}", counters.seqn.0);

        let padding_length = self.padding_length(payload);
        let packet_length = PADDING_LENGTH_LEN + payload.len() + padding_length;
        let offset = buffer.len();

        buffer.extend(&(packet_length as u32).to_be_bytes());
        buffer.push(padding_length as u8);
        buffer.extend(payload);
        self.fill_padding(buffer.resize_mut(padding_length));
        buffer.resize_mut(self.tag_len());

        #[allow(clippy::indexing_slicing)] // length checked
        let (plaintext, tag) =
            buffer[offset..].split_at_mut(PACKET_LENGTH_LEN + packet_length);

        self.seal(counters.seqn.0, plaintext, tag);

        counters.advance(PACKET_LENGTH_LEN + packet_length + self.tag_len());
    }
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` while `buf` does not yet hold a complete frame. On
/// success the frame is removed from `buf` and the sequence number advances;
/// on error nothing is consumed and the transport must be torn down.
pub(crate) fn try_decode(
    buf: &mut Sequence,
    counters: &mut StreamCounters,
    cipher: &mut (dyn OpeningKey + Send),
    max_packet_len: usize,
    pool: &Arc<BufPool>,
) -> Result<Option<Packet>, Error> {
    let mut prefix = [0; PACKET_LENGTH_LEN];
    if !buf.peek(&mut prefix) {
        return Ok(None);
    }
    let seqn = counters.seqn.0;
    let len_bytes = cipher.decrypt_packet_length(seqn, prefix);
    let len = BigEndian::read_u32(&len_bytes) as usize;
    trace!("reading, seqn = {seqn:?}, clear len = {len:?}");

    if len > max_packet_len || len > HARD_MAXIMUM_PACKET_LEN {
        return Err(Error::PacketTooLong(len));
    }
    if len < PADDING_LENGTH_LEN + MINIMUM_PADDING_LEN || !cipher.check_length(len) {
        return Err(Error::BadLength);
    }

    let total = PACKET_LENGTH_LEN + len + cipher.tag_len();
    if buf.len() < total {
        return Ok(None);
    }

    let mut frame = pool.take();
    buf.copy_out(total, &mut frame);
    if let Err(e) = cipher.open(seqn, &mut frame) {
        pool.put(frame);
        return Err(e);
    }

    let padding_length = frame.get(PACKET_LENGTH_LEN).copied().unwrap_or(0) as usize;
    let body_end = PACKET_LENGTH_LEN + len;
    let payload_start = PACKET_LENGTH_LEN + PADDING_LENGTH_LEN;
    let payload_end = match body_end.checked_sub(padding_length) {
        Some(end) if padding_length >= MINIMUM_PADDING_LEN && end >= payload_start => end,
        _ => {
            pool.put(frame);
            return Err(Error::MalformedPacket);
        }
    };

    buf.remove(total);
    counters.advance(total);

    // Drop padding and tag before the payload leaves the codec.
    frame.resize(body_end);
    Ok(Some(Packet::new(
        pool.clone(),
        frame,
        payload_start..payload_end,
    )))
}

pub(crate) const PACKET_LENGTH_LEN: usize = 4;
pub(crate) const PADDING_LENGTH_LEN: usize = 1;
pub(crate) const MINIMUM_PADDING_LEN: usize = 4;

/// https://tools.ietf.org/html/rfc4253#section-6.1 requires support for
/// 35000-byte packets; that is also the default ceiling.
pub const DEFAULT_MAX_PACKET_LEN: usize = 35000;

/// Nothing we negotiate ever frames more than this; a larger declared
/// length is an attack or corruption.
const HARD_MAXIMUM_PACKET_LEN: usize = 1 << 18;
