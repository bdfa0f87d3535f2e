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
use std::marker::PhantomData;

use aes::cipher::{IvSizeUser, KeyIvInit, KeySizeUser, StreamCipher};
use generic_array::GenericArray;
use rand::RngCore;

use crate::mac::{Mac, MacAlgorithm};
use crate::Error;

/// CTR-mode stream ciphers paired with an HMAC, in either MAC ordering.
///
/// With an `-etm@openssh.com` MAC the packet length stays plaintext and the
/// MAC covers the encrypted packet; otherwise the whole packet (length
/// included) is encrypted and the MAC covers the plaintext.
pub struct SshBlockCipher<C: StreamCipher + KeySizeUser + IvSizeUser>(pub PhantomData<C>);

const BLOCK_SIZE: usize = 16;

impl<C: StreamCipher + KeySizeUser + IvSizeUser + KeyIvInit + Clone + Send + 'static> super::Cipher
    for SshBlockCipher<C>
{
    fn needs_mac(&self) -> bool {
        true
    }

    fn key_len(&self) -> usize {
        C::key_size()
    }

    fn iv_len(&self) -> usize {
        C::iv_size()
    }

    fn make_opening_key(
        &self,
        k: &[u8],
        n: &[u8],
        m: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Box<dyn super::OpeningKey + Send> {
        let mut key = GenericArray::<u8, C::KeySize>::default();
        let mut nonce = GenericArray::<u8, C::IvSize>::default();
        key.clone_from_slice(k);
        nonce.clone_from_slice(n);
        Box::new(OpeningKey {
            cipher: C::new(&key, &nonce),
            mac: mac.make_mac(m),
        })
    }

    fn make_sealing_key(
        &self,
        k: &[u8],
        n: &[u8],
        m: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Box<dyn super::SealingKey + Send> {
        let mut key = GenericArray::<u8, C::KeySize>::default();
        let mut nonce = GenericArray::<u8, C::IvSize>::default();
        key.clone_from_slice(k);
        nonce.clone_from_slice(n);
        Box::new(SealingKey {
            cipher: C::new(&key, &nonce),
            mac: mac.make_mac(m),
        })
    }
}

pub struct OpeningKey<C: StreamCipher> {
    cipher: C,
    mac: Box<dyn Mac + Send>,
}

pub struct SealingKey<C: StreamCipher> {
    cipher: C,
    mac: Box<dyn Mac + Send>,
}

impl<C: StreamCipher + Clone> super::OpeningKey for OpeningKey<C> {
    fn decrypt_packet_length(&self, _seqn: u32, mut encrypted_packet_length: [u8; 4]) -> [u8; 4] {
        if self.mac.is_etm() {
            encrypted_packet_length
        } else {
            // Peek with a clone so the keystream position does not advance
            // before open() processes the whole packet.
            let mut cipher = self.cipher.clone();
            cipher.apply_keystream(&mut encrypted_packet_length);
            encrypted_packet_length
        }
    }

    fn check_length(&self, length: usize) -> bool {
        if self.mac.is_etm() {
            length % BLOCK_SIZE == 0
        } else {
            (super::PACKET_LENGTH_LEN + length) % BLOCK_SIZE == 0
        }
    }

    fn tag_len(&self) -> usize {
        self.mac.mac_len()
    }

    fn open(&mut self, seqn: u32, frame: &mut [u8]) -> Result<(), Error> {
        let body_len = frame.len() - self.mac.mac_len();
        let (body, tag) = frame.split_at_mut(body_len);
        if self.mac.is_etm() {
            // MAC over the encrypted packet, then decrypt the remainder.
            if !self.mac.verify(seqn, body, tag) {
                return Err(Error::IntegrityFailure);
            }
            self.cipher
                .apply_keystream(body.get_mut(super::PACKET_LENGTH_LEN..).unwrap_or_default());
        } else {
            // Decrypt everything (the length was encrypted too), then MAC
            // over the plaintext.
            self.cipher.apply_keystream(body);
            if !self.mac.verify(seqn, body, tag) {
                return Err(Error::IntegrityFailure);
            }
        }
        Ok(())
    }
}

impl<C: StreamCipher> super::SealingKey for SealingKey<C> {
    fn padding_length(&self, payload: &[u8]) -> usize {
        // ETM excludes the plaintext length field from the alignment.
        let covered = if self.mac.is_etm() {
            super::PADDING_LENGTH_LEN + payload.len()
        } else {
            super::PACKET_LENGTH_LEN + super::PADDING_LENGTH_LEN + payload.len()
        };
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
        self.mac.mac_len()
    }

    fn seal(&mut self, seqn: u32, plaintext_in_ciphertext_out: &mut [u8], tag_out: &mut [u8]) {
        if self.mac.is_etm() {
            self.cipher.apply_keystream(
                plaintext_in_ciphertext_out
                    .get_mut(super::PACKET_LENGTH_LEN..)
                    .unwrap_or_default(),
            );
            self.mac.compute(seqn, plaintext_in_ciphertext_out, tag_out);
        } else {
            self.mac.compute(seqn, plaintext_in_ciphertext_out, tag_out);
            self.cipher.apply_keystream(plaintext_in_ciphertext_out);
        }
    }
}
