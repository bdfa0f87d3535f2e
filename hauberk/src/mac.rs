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
//! This module exports MAC algorithm names for use with [Preferred][crate::Preferred].

use std::collections::HashMap;
use std::convert::TryFrom;
use std::marker::PhantomData;
use std::sync::LazyLock;

use byteorder::{BigEndian, ByteOrder};
use delegate::delegate;
use digest::typenum::{U20, U32, U64, Unsigned};
use digest::KeyInit;
use generic_array::{ArrayLength, GenericArray};
use hmac::Hmac;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use ssh_encoding::Encode;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

pub(crate) trait MacAlgorithm {
    fn key_len(&self) -> usize;
    fn make_mac(&self, key: &[u8]) -> Box<dyn Mac + Send>;
}

pub(crate) trait Mac {
    fn mac_len(&self) -> usize;
    /// Encrypt-then-MAC: the length field stays plaintext and the MAC covers
    /// the encrypted packet. Otherwise the MAC covers the plaintext and the
    /// whole packet (length included) is encrypted.
    fn is_etm(&self) -> bool {
        false
    }
    fn compute(&self, sequence_number: u32, data: &[u8], output: &mut [u8]);
    fn verify(&self, sequence_number: u32, data: &[u8], tag: &[u8]) -> bool;
}

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

impl TryFrom<&str> for Name {
    type Error = ();
    fn try_from(s: &str) -> Result<Name, ()> {
        MACS.keys().find(|x| x.0 == s).map(|x| **x).ok_or(())
    }
}

/// `none`
pub const NONE: Name = Name("none");
/// `hmac-sha1`
pub const HMAC_SHA1: Name = Name("hmac-sha1");
/// `hmac-sha2-256`
pub const HMAC_SHA256: Name = Name("hmac-sha2-256");
/// `hmac-sha2-512`
pub const HMAC_SHA512: Name = Name("hmac-sha2-512");
/// `hmac-sha1-etm@openssh.com`
pub const HMAC_SHA1_ETM: Name = Name("hmac-sha1-etm@openssh.com");
/// `hmac-sha2-256-etm@openssh.com`
pub const HMAC_SHA256_ETM: Name = Name("hmac-sha2-256-etm@openssh.com");
/// `hmac-sha2-512-etm@openssh.com`
pub const HMAC_SHA512_ETM: Name = Name("hmac-sha2-512-etm@openssh.com");

/// HMAC over the sequence number and the packet bytes, in either MAC
/// ordering depending on `etm`.
pub(crate) struct HmacMacAlgorithm<M: digest::Mac + KeyInit + Send + 'static, KL: ArrayLength<u8>> {
    etm: bool,
    _m: PhantomData<M>,
    _kl: PhantomData<KL>,
}

pub(crate) struct HmacMac<M: digest::Mac + KeyInit + Send + 'static, KL: ArrayLength<u8>> {
    key: GenericArray<u8, KL>,
    etm: bool,
    _m: PhantomData<M>,
}

impl<M: digest::Mac + KeyInit + Send + 'static, KL: ArrayLength<u8> + 'static> MacAlgorithm
    for HmacMacAlgorithm<M, KL>
{
    fn key_len(&self) -> usize {
        KL::to_usize()
    }

    fn make_mac(&self, mac_key: &[u8]) -> Box<dyn Mac + Send> {
        let mut key = GenericArray::<u8, KL>::default();
        key.clone_from_slice(mac_key);
        Box::new(HmacMac::<M, KL> {
            key,
            etm: self.etm,
            _m: PhantomData,
        })
    }
}

impl<M: digest::Mac + KeyInit + Send + 'static, KL: ArrayLength<u8>> Drop for HmacMac<M, KL> {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl<M: digest::Mac + KeyInit + Send + 'static, KL: ArrayLength<u8>> Mac for HmacMac<M, KL> {
    fn mac_len(&self) -> usize {
        M::OutputSize::to_usize()
    }

    fn is_etm(&self) -> bool {
        self.etm
    }

    fn compute(&self, sequence_number: u32, data: &[u8], output: &mut [u8]) {
        #[allow(clippy::unwrap_used)] // HMAC accepts any key length
        let mut hmac = <M as digest::Mac>::new_from_slice(&self.key).unwrap();
        let mut seqno_buf = [0; 4];
        BigEndian::write_u32(&mut seqno_buf, sequence_number);
        hmac.update(&seqno_buf);
        hmac.update(data);
        output.clone_from_slice(&hmac.finalize().into_bytes());
    }

    fn verify(&self, sequence_number: u32, data: &[u8], tag: &[u8]) -> bool {
        let mut buf = GenericArray::<u8, M::OutputSize>::default();
        self.compute(sequence_number, data, &mut buf);
        buf.ct_eq(tag).into()
    }
}

pub(crate) struct NoMacAlgorithm;

struct NoMac;

impl MacAlgorithm for NoMacAlgorithm {
    fn key_len(&self) -> usize {
        0
    }
    fn make_mac(&self, _: &[u8]) -> Box<dyn Mac + Send> {
        Box::new(NoMac)
    }
}

impl Mac for NoMac {
    fn mac_len(&self) -> usize {
        0
    }
    fn compute(&self, _: u32, _: &[u8], _: &mut [u8]) {}
    fn verify(&self, _: u32, _: &[u8], _: &[u8]) -> bool {
        true
    }
}

pub(crate) static _NONE: NoMacAlgorithm = NoMacAlgorithm;
pub(crate) static _HMAC_SHA1: HmacMacAlgorithm<Hmac<Sha1>, U20> = HmacMacAlgorithm {
    etm: false,
    _m: PhantomData,
    _kl: PhantomData,
};
pub(crate) static _HMAC_SHA256: HmacMacAlgorithm<Hmac<Sha256>, U32> = HmacMacAlgorithm {
    etm: false,
    _m: PhantomData,
    _kl: PhantomData,
};
pub(crate) static _HMAC_SHA512: HmacMacAlgorithm<Hmac<Sha512>, U64> = HmacMacAlgorithm {
    etm: false,
    _m: PhantomData,
    _kl: PhantomData,
};
pub(crate) static _HMAC_SHA1_ETM: HmacMacAlgorithm<Hmac<Sha1>, U20> = HmacMacAlgorithm {
    etm: true,
    _m: PhantomData,
    _kl: PhantomData,
};
pub(crate) static _HMAC_SHA256_ETM: HmacMacAlgorithm<Hmac<Sha256>, U32> = HmacMacAlgorithm {
    etm: true,
    _m: PhantomData,
    _kl: PhantomData,
};
pub(crate) static _HMAC_SHA512_ETM: HmacMacAlgorithm<Hmac<Sha512>, U64> = HmacMacAlgorithm {
    etm: true,
    _m: PhantomData,
    _kl: PhantomData,
};

pub const ALL_MAC_ALGORITHMS: &[&Name] = &[
    &NONE,
    &HMAC_SHA1,
    &HMAC_SHA256,
    &HMAC_SHA512,
    &HMAC_SHA1_ETM,
    &HMAC_SHA256_ETM,
    &HMAC_SHA512_ETM,
];

pub(crate) static MACS: LazyLock<HashMap<&'static Name, &(dyn MacAlgorithm + Send + Sync)>> =
    LazyLock::new(|| {
        let mut h: HashMap<&'static Name, &(dyn MacAlgorithm + Send + Sync)> = HashMap::new();
        h.insert(&NONE, &_NONE);
        h.insert(&HMAC_SHA1, &_HMAC_SHA1);
        h.insert(&HMAC_SHA256, &_HMAC_SHA256);
        h.insert(&HMAC_SHA512, &_HMAC_SHA512);
        h.insert(&HMAC_SHA1_ETM, &_HMAC_SHA1_ETM);
        h.insert(&HMAC_SHA256_ETM, &_HMAC_SHA256_ETM);
        h.insert(&HMAC_SHA512_ETM, &_HMAC_SHA512_ETM);
        assert_eq!(h.len(), ALL_MAC_ALGORITHMS.len());
        h
    });

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_verify_round_trip() {
        let algo = &_HMAC_SHA256;
        let mac = algo.make_mac(&[7u8; 32]);
        let mut tag = vec![0u8; mac.mac_len()];
        mac.compute(3, b"some packet", &mut tag);
        assert!(mac.verify(3, b"some packet", &tag));
        assert!(!mac.verify(4, b"some packet", &tag));
        assert!(!mac.verify(3, b"some packe?", &tag));
    }

    #[test]
    fn etm_flag_follows_the_name() {
        assert!(_HMAC_SHA256_ETM.make_mac(&[0u8; 32]).is_etm());
        assert!(!_HMAC_SHA256.make_mac(&[0u8; 32]).is_etm());
    }
}
