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
// https://tools.ietf.org/html/rfc5647

use std::marker::PhantomData;

use aes_gcm::{AeadCore, AeadInPlace, KeyInit, KeySizeUser};
use byteorder::{BigEndian, ByteOrder};
use digest::typenum::Unsigned;
use generic_array::GenericArray;
use rand::RngCore;
use zeroize::Zeroize;

use crate::mac::MacAlgorithm;
use crate::Error;

/// AES-GCM per RFC 5647: the packet length stays plaintext and is the AAD,
/// the 12-byte IV splits into a 4-byte fixed field and an 8-byte invocation
/// counter incremented big-endian after every packet.
pub struct GcmCipher<A>(pub PhantomData<A>);

const BLOCK_SIZE: usize = 16;

type Nonce<A> = GenericArray<u8, <A as AeadCore>::NonceSize>;
type Tag<A> = GenericArray<u8, <A as AeadCore>::TagSize>;

impl<A> super::Cipher for GcmCipher<A>
where
    A: AeadInPlace + KeyInit + KeySizeUser + Send + Sync + 'static,
{
    fn key_len(&self) -> usize {
        A::key_size()
    }

    fn iv_len(&self) -> usize {
        A::NonceSize::to_usize()
    }

    fn make_opening_key(
        &self,
        k: &[u8],
        n: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Box<dyn super::OpeningKey + Send> {
        Box::new(OpeningKey {
            state: GcmState::<A>::new(k, n),
        })
    }

    fn make_sealing_key(
        &self,
        k: &[u8],
        n: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Box<dyn super::SealingKey + Send> {
        Box::new(SealingKey {
            state: GcmState::<A>::new(k, n),
        })
    }
}

struct GcmState<A: AeadCore> {
    cipher: A,
    nonce: Nonce<A>,
}

impl<A: AeadInPlace + KeyInit> GcmState<A> {
    fn new(k: &[u8], n: &[u8]) -> Self {
        let mut key = GenericArray::<u8, A::KeySize>::default();
        key.clone_from_slice(k);
        let mut nonce = Nonce::<A>::default();
        nonce.clone_from_slice(n);
        let state = GcmState {
            cipher: A::new(&key),
            nonce,
        };
        key.zeroize();
        state
    }

    /// The invocation counter lives in the last 8 bytes of the IV and moves
    /// forward once per packet.
    fn advance_nonce(&mut self) {
        let i0 = self.nonce.len() - 8;
        #[allow(clippy::indexing_slicing)] // length checked
        let ctr = BigEndian::read_u64(&self.nonce[i0..]);
        #[allow(clippy::indexing_slicing)] // length checked
        BigEndian::write_u64(&mut self.nonce[i0..], ctr.wrapping_add(1));
    }
}

impl<A: AeadCore> Drop for GcmState<A> {
    fn drop(&mut self) {
        self.nonce.zeroize();
    }
}

pub struct OpeningKey<A: AeadCore> {
    state: GcmState<A>,
}

pub struct SealingKey<A: AeadCore> {
    state: GcmState<A>,
}

impl<A> super::OpeningKey for OpeningKey<A>
where
    A: AeadInPlace + KeyInit + Send + 'static,
{
    fn decrypt_packet_length(&self, _seqn: u32, packet_length: [u8; 4]) -> [u8; 4] {
        // Sent in the clear, covered as AAD.
        packet_length
    }

    fn check_length(&self, length: usize) -> bool {
        // The ciphertext (padding length byte onwards) must fill whole
        // AES blocks.
        length % BLOCK_SIZE == 0
    }

    fn tag_len(&self) -> usize {
        A::TagSize::to_usize()
    }

    fn open(&mut self, _seqn: u32, frame: &mut [u8]) -> Result<(), Error> {
        let body_len = frame.len() - A::TagSize::to_usize();
        let (body, tag) = frame.split_at_mut(body_len);
        let (aad, ciphertext) = body.split_at_mut(super::PACKET_LENGTH_LEN);

        let mut tag_buf = Tag::<A>::default();
        tag_buf.clone_from_slice(tag);

        self.state
            .cipher
            .decrypt_in_place_detached(&self.state.nonce, aad, ciphertext, &tag_buf)
            .map_err(|_| Error::IntegrityFailure)?;

        self.state.advance_nonce();
        Ok(())
    }
}

impl<A> super::SealingKey for SealingKey<A>
where
    A: AeadInPlace + KeyInit + Send + 'static,
{
    fn padding_length(&self, payload: &[u8]) -> usize {
        // The AAD length field does not count towards the alignment.
        let covered = super::PADDING_LENGTH_LEN + payload.len();
        let padding_len = BLOCK_SIZE - (covered % BLOCK_SIZE);
        if padding_len < super::MINIMUM_PADDING_LEN {
            padding_len + BLOCK_SIZE
        } else {
            padding_len
        }
    }

    fn fill_padding(&self, padding_out: &mut [u8]) {
        rand::thread_rng().fill_bytes(padding_out);
    }

    fn tag_len(&self) -> usize {
        A::TagSize::to_usize()
    }

    fn seal(&mut self, _seqn: u32, plaintext_in_ciphertext_out: &mut [u8], tag_out: &mut [u8]) {
        let (aad, plaintext) =
            plaintext_in_ciphertext_out.split_at_mut(super::PACKET_LENGTH_LEN);

        #[allow(clippy::unwrap_used)] // in-place GCM encryption cannot fail
        let tag = self
            .state
            .cipher
            .encrypt_in_place_detached(&self.state.nonce, aad, plaintext)
            .unwrap();

        self.state.advance_nonce();
        tag_out.clone_from_slice(&tag);
    }
}
