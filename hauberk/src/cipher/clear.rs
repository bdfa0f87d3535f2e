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
use crate::mac::MacAlgorithm;
use crate::Error;

/// The pre-KEX `none` framing: plaintext packets, no MAC.
#[derive(Debug)]
pub struct Clear {}

pub struct Key;

impl super::Cipher for Clear {
    fn key_len(&self) -> usize {
        0
    }

    fn make_opening_key(
        &self,
        _: &[u8],
        _: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Box<dyn super::OpeningKey + Send> {
        Box::new(Key)
    }

    fn make_sealing_key(
        &self,
        _: &[u8],
        _: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Box<dyn super::SealingKey + Send> {
        Box::new(Key)
    }
}

impl super::OpeningKey for Key {
    fn decrypt_packet_length(&self, _seqn: u32, packet_length: [u8; 4]) -> [u8; 4] {
        packet_length
    }

    fn check_length(&self, length: usize) -> bool {
        (super::PACKET_LENGTH_LEN + length) % 8 == 0
    }

    fn tag_len(&self) -> usize {
        0
    }

    fn open(&mut self, _seqn: u32, _frame: &mut [u8]) -> Result<(), Error> {
        Ok(())
    }
}

impl super::SealingKey for Key {
    fn padding_length(&self, payload: &[u8]) -> usize {
        let block_size = 8;
        let padding_len = block_size
            - ((super::PACKET_LENGTH_LEN + super::PADDING_LENGTH_LEN + payload.len()) % block_size);
        if padding_len < super::MINIMUM_PADDING_LEN {
            padding_len + block_size
        } else {
            padding_len
        }
    }

    // Plaintext framing carries no secrets worth hiding in the padding.
    fn fill_padding(&self, padding_out: &mut [u8]) {
        for b in padding_out {
            *b = 0;
        }
    }

    fn tag_len(&self) -> usize {
        0
    }

    fn seal(&mut self, _seqn: u32, _plaintext_in_ciphertext_out: &mut [u8], _tag_out: &mut [u8]) {}
}
