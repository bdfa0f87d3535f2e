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
// http://cvsweb.openbsd.org/cgi-bin/cvsweb/src/usr.bin/ssh/PROTOCOL.chacha20poly1305?annotate=HEAD

use byteorder::{BigEndian, ByteOrder};
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20Legacy;
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::mac::MacAlgorithm;
use crate::Error;

/// The OpenSSH ChaCha20-Poly1305 construction. Takes 64 bytes of key
/// material: the first 32 bytes key the payload (and the per-packet
/// Poly1305 key, drawn from keystream block 0), the second 32 bytes key the
/// length field. The 8-byte nonce is the packet sequence number.
pub struct SshChacha20Poly1305Cipher {}

const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const BLOCK_SIZE: usize = 8;

impl super::Cipher for SshChacha20Poly1305Cipher {
    fn key_len(&self) -> usize {
        2 * KEY_LEN
    }

    fn make_opening_key(
        &self,
        k: &[u8],
        _: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Box<dyn super::OpeningKey + Send> {
        Box::new(OpeningKey { keys: Keys::new(k) })
    }

    fn make_sealing_key(
        &self,
        k: &[u8],
        _: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Box<dyn super::SealingKey + Send> {
        Box::new(SealingKey { keys: Keys::new(k) })
    }
}

struct Keys {
    payload_key: [u8; KEY_LEN],
    length_key: [u8; KEY_LEN],
}

impl Keys {
    fn new(k: &[u8]) -> Self {
        let mut payload_key = [0; KEY_LEN];
        let mut length_key = [0; KEY_LEN];
        payload_key.clone_from_slice(k.get(..KEY_LEN).unwrap_or_default());
        length_key.clone_from_slice(k.get(KEY_LEN..2 * KEY_LEN).unwrap_or_default());
        Keys {
            payload_key,
            length_key,
        }
    }

    fn nonce(seqn: u32) -> [u8; 8] {
        let mut nonce = [0; 8];
        BigEndian::write_u64(&mut nonce, seqn as u64);
        nonce
    }

    fn length_cipher(&self, seqn: u32) -> ChaCha20Legacy {
        ChaCha20Legacy::new(
            (&self.length_key).into(),
            (&Self::nonce(seqn)).into(),
        )
    }

    fn payload_cipher(&self, seqn: u32) -> ChaCha20Legacy {
        ChaCha20Legacy::new(
            (&self.payload_key).into(),
            (&Self::nonce(seqn)).into(),
        )
    }

    /// The one-time Poly1305 key: keystream block 0 of the payload cipher.
    fn poly_key(&self, seqn: u32) -> poly1305::Key {
        let mut key = [0u8; KEY_LEN];
        self.payload_cipher(seqn).apply_keystream(&mut key);
        key.into()
    }

    fn tag(&self, seqn: u32, body: &[u8]) -> poly1305::Tag {
        Poly1305::new(&self.poly_key(seqn)).compute_unpadded(body)
    }
}

impl Drop for Keys {
    fn drop(&mut self) {
        self.payload_key.zeroize();
        self.length_key.zeroize();
    }
}

pub struct OpeningKey {
    keys: Keys,
}

pub struct SealingKey {
    keys: Keys,
}

impl super::OpeningKey for OpeningKey {
    fn decrypt_packet_length(&self, seqn: u32, mut encrypted_packet_length: [u8; 4]) -> [u8; 4] {
        self.keys
            .length_cipher(seqn)
            .apply_keystream(&mut encrypted_packet_length);
        encrypted_packet_length
    }

    fn check_length(&self, length: usize) -> bool {
        length % BLOCK_SIZE == 0
    }

    fn tag_len(&self) -> usize {
        TAG_LEN
    }

    fn open(&mut self, seqn: u32, frame: &mut [u8]) -> Result<(), Error> {
        let body_len = frame.len() - TAG_LEN;
        let (body, tag) = frame.split_at_mut(body_len);

        let expected = self.keys.tag(seqn, body);
        if !bool::from(expected.ct_eq(tag)) {
            return Err(Error::IntegrityFailure);
        }

        // Keystream block 0 went to the Poly1305 key; payload starts at
        // block 1.
        let mut cipher = self.keys.payload_cipher(seqn);
        cipher.seek(64u64);
        cipher.apply_keystream(body.get_mut(super::PACKET_LENGTH_LEN..).unwrap_or_default());

        let mut length = [0; 4];
        length.clone_from_slice(body.get(..4).unwrap_or_default());
        let decrypted = self.decrypt_packet_length(seqn, length);
        body.get_mut(..4)
            .unwrap_or_default()
            .clone_from_slice(&decrypted);
        Ok(())
    }
}

impl super::SealingKey for SealingKey {
    fn padding_length(&self, payload: &[u8]) -> usize {
        // The encrypted length field does not count towards the alignment.
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
        TAG_LEN
    }

    fn seal(&mut self, seqn: u32, plaintext_in_ciphertext_out: &mut [u8], tag_out: &mut [u8]) {
        let body = plaintext_in_ciphertext_out;

        self.keys
            .length_cipher(seqn)
            .apply_keystream(body.get_mut(..super::PACKET_LENGTH_LEN).unwrap_or_default());

        let mut cipher = self.keys.payload_cipher(seqn);
        cipher.seek(64u64);
        cipher.apply_keystream(body.get_mut(super::PACKET_LENGTH_LEN..).unwrap_or_default());

        tag_out.clone_from_slice(&self.keys.tag(seqn, body));
    }
}
