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
//! This module exports kex algorithm names for use with [Preferred][crate::Preferred].

mod curve25519;
mod dh;
mod ecdh_nistp;

use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::LazyLock;

use curve25519::Curve25519KexType;
use delegate::delegate;
use dh::{DhGroup14Sha256KexType, DhGroup16Sha512KexType};
use digest::Digest;
use ecdh_nistp::EcdhNistP256KexType;
use ssh_encoding::Encode;

use crate::cipher::{Cipher, CipherPair, CIPHERS};
use crate::mac::{MacAlgorithm, MACS};
use crate::negotiation::Names;
use crate::{Error, SecureVec};

/// Both sides' identifiers and KEXINIT payloads plus the ephemeral publics:
/// everything the exchange hash binds.
#[derive(Debug, Clone, Default)]
pub(crate) struct Exchange {
    pub client_id: SecureVec,
    pub server_id: SecureVec,
    pub client_kex_init: SecureVec,
    pub server_kex_init: SecureVec,
    pub client_ephemeral: SecureVec,
    pub server_ephemeral: SecureVec,
}

impl Exchange {
    pub fn new(client_id: &[u8], server_id: &[u8]) -> Self {
        Exchange {
            client_id: SecureVec::from_slice(client_id),
            server_id: SecureVec::from_slice(server_id),
            ..Default::default()
        }
    }
}

/// The output of one key exchange: the negotiated names, the freshly keyed
/// codec pair, and the hashes the session binds to.
pub(crate) struct NewKeys {
    pub names: Names,
    pub cipher: CipherPair,
    pub session_id: SecureVec,
    pub exchange_hash: SecureVec,
}

pub(crate) trait KexAlgorithm: Send {
    /// Generate the ephemeral secret, record the public half in
    /// `client_ephemeral` and write the KEX init message into `writer`.
    fn client_dh(
        &mut self,
        client_ephemeral: &mut SecureVec,
        writer: &mut SecureVec,
    ) -> Result<(), Error>;

    fn compute_shared_secret(&mut self, remote_pubkey: &[u8]) -> Result<(), Error>;

    fn compute_exchange_hash(
        &self,
        server_host_key: &[u8],
        exchange: &Exchange,
    ) -> Result<SecureVec, Error>;

    fn compute_keys(
        &self,
        session_id: &SecureVec,
        exchange_hash: &SecureVec,
        names: &Names,
        is_server: bool,
    ) -> Result<CipherPair, Error>;
}

pub(crate) trait KexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send>;
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
        KEXES.keys().find(|x| x.0 == s).map(|x| **x).ok_or(())
    }
}

/// `curve25519-sha256`
pub const CURVE25519: Name = Name("curve25519-sha256");
/// `curve25519-sha256@libssh.org`
pub const CURVE25519_PRE_RFC_8731: Name = Name("curve25519-sha256@libssh.org");
/// `ecdh-sha2-nistp256`
pub const ECDH_SHA2_NISTP256: Name = Name("ecdh-sha2-nistp256");
/// `diffie-hellman-group14-sha256`
pub const DH_G14_SHA256: Name = Name("diffie-hellman-group14-sha256");
/// `diffie-hellman-group16-sha512`
pub const DH_G16_SHA512: Name = Name("diffie-hellman-group16-sha512");

const _CURVE25519: Curve25519KexType = Curve25519KexType {};
const _ECDH_SHA2_NISTP256: EcdhNistP256KexType = EcdhNistP256KexType {};
const _DH_G14_SHA256: DhGroup14Sha256KexType = DhGroup14Sha256KexType {};
const _DH_G16_SHA512: DhGroup16Sha512KexType = DhGroup16Sha512KexType {};

pub const ALL_KEX_ALGORITHMS: &[&Name] = &[
    &CURVE25519,
    &CURVE25519_PRE_RFC_8731,
    &ECDH_SHA2_NISTP256,
    &DH_G14_SHA256,
    &DH_G16_SHA512,
];

pub(crate) static KEXES: LazyLock<HashMap<&'static Name, &(dyn KexType + Send + Sync)>> =
    LazyLock::new(|| {
        let mut h: HashMap<&'static Name, &(dyn KexType + Send + Sync)> = HashMap::new();
        h.insert(&CURVE25519, &_CURVE25519);
        h.insert(&CURVE25519_PRE_RFC_8731, &_CURVE25519);
        h.insert(&ECDH_SHA2_NISTP256, &_ECDH_SHA2_NISTP256);
        h.insert(&DH_G14_SHA256, &_DH_G14_SHA256);
        h.insert(&DH_G16_SHA512, &_DH_G16_SHA512);
        assert_eq!(h.len(), ALL_KEX_ALGORITHMS.len());
        h
    });

/// Hash the exchange per RFC 5656 page 7: identifiers, KEXINIT payloads,
/// host key, ephemerals and the shared secret, each in its wire form.
pub(crate) fn hash_exchange<D: Digest>(
    server_host_key: &[u8],
    exchange: &Exchange,
    shared_mpint: &[u8],
) -> Result<SecureVec, Error> {
    let mut buffer = SecureVec::new();
    exchange.client_id.as_ref().encode(&mut buffer)?;
    exchange.server_id.as_ref().encode(&mut buffer)?;
    exchange.client_kex_init.as_ref().encode(&mut buffer)?;
    exchange.server_kex_init.as_ref().encode(&mut buffer)?;
    server_host_key.encode(&mut buffer)?;
    exchange.client_ephemeral.as_ref().encode(&mut buffer)?;
    exchange.server_ephemeral.as_ref().encode(&mut buffer)?;
    buffer.extend(shared_mpint);

    let mut res = SecureVec::new();
    res.extend(&D::digest(&buffer));
    Ok(res)
}

/// Derive the six session keys and build the codec pair.
///
/// Each key is `HASH(K || H || letter || session_id)`, extended by
/// `HASH(K || H || key-so-far)` until long enough
/// (https://tools.ietf.org/html/rfc4253#section-7.2).
pub(crate) fn compute_keys<D: Digest>(
    shared_mpint: &[u8],
    session_id: &SecureVec,
    exchange_hash: &SecureVec,
    names: &Names,
    is_server: bool,
) -> Result<CipherPair, Error> {
    let (c2s_cipher_name, s2c_cipher_name) = (&names.cipher_c2s, &names.cipher_s2c);
    let c2s_cipher = CIPHERS.get(c2s_cipher_name).ok_or(Error::UnknownAlgo)?;
    let s2c_cipher = CIPHERS.get(s2c_cipher_name).ok_or(Error::UnknownAlgo)?;
    let c2s_mac = MACS.get(&names.mac_c2s).ok_or(Error::UnknownAlgo)?;
    let s2c_mac = MACS.get(&names.mac_s2c).ok_or(Error::UnknownAlgo)?;

    let compute_key = |letter: u8, len: usize| -> Result<SecureVec, Error> {
        let mut key = SecureVec::new();
        let mut buffer = SecureVec::new();
        buffer.extend(shared_mpint);
        buffer.extend(exchange_hash.as_ref());
        buffer.push(letter);
        buffer.extend(session_id.as_ref());
        key.extend(&D::digest(&buffer));

        while key.len() < len {
            buffer.clear();
            buffer.extend(shared_mpint);
            buffer.extend(exchange_hash.as_ref());
            buffer.extend(&key);
            key.extend(&D::digest(&buffer));
        }

        key.resize(len);
        Ok(key)
    };

    // https://tools.ietf.org/html/rfc4253#section-7.2: A/B are IVs, C/D
    // encryption keys, E/F MAC keys, client-to-server first.
    let (c2s_iv, s2c_iv) = (b'A', b'B');
    let (c2s_key, s2c_key) = (b'C', b'D');
    let (c2s_mac_key, s2c_mac_key) = (b'E', b'F');

    let build_sealing = |cipher: &&(dyn crate::cipher::Cipher + Send + Sync),
                         mac: &&(dyn crate::mac::MacAlgorithm + Send + Sync),
                         iv_letter: u8,
                         key_letter: u8,
                         mac_letter: u8|
     -> Result<Box<dyn crate::cipher::SealingKey + Send>, Error> {
        let key = compute_key(key_letter, cipher.key_len())?;
        let iv = compute_key(iv_letter, cipher.iv_len())?;
        let mac_key = compute_key(mac_letter, mac.key_len())?;
        Ok(cipher.make_sealing_key(&key, &iv, &mac_key, *mac))
    };
    let build_opening = |cipher: &&(dyn crate::cipher::Cipher + Send + Sync),
                         mac: &&(dyn crate::mac::MacAlgorithm + Send + Sync),
                         iv_letter: u8,
                         key_letter: u8,
                         mac_letter: u8|
     -> Result<Box<dyn crate::cipher::OpeningKey + Send>, Error> {
        let key = compute_key(key_letter, cipher.key_len())?;
        let iv = compute_key(iv_letter, cipher.iv_len())?;
        let mac_key = compute_key(mac_letter, mac.key_len())?;
        Ok(cipher.make_opening_key(&key, &iv, &mac_key, *mac))
    };

    Ok(if is_server {
        CipherPair {
            local_to_remote: build_sealing(s2c_cipher, s2c_mac, s2c_iv, s2c_key, s2c_mac_key)?,
            remote_to_local: build_opening(c2s_cipher, c2s_mac, c2s_iv, c2s_key, c2s_mac_key)?,
        }
    } else {
        CipherPair {
            local_to_remote: build_sealing(c2s_cipher, c2s_mac, c2s_iv, c2s_key, c2s_mac_key)?,
            remote_to_local: build_opening(s2c_cipher, s2c_mac, s2c_iv, s2c_key, s2c_mac_key)?,
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::cipher::SealingKey;
    use crate::negotiation::{read_kex, write_kex, Preferred};

    fn names() -> Names {
        let kexinit = write_kex(&Preferred::DEFAULT).unwrap();
        read_kex(&kexinit, &Preferred::DEFAULT).unwrap()
    }

    #[test]
    fn derived_keys_are_deterministic_and_direction_symmetric() {
        let names = names();
        let shared = b"\x00\x00\x00\x01\x42";
        let h = SecureVec::from_slice(&[7u8; 32]);

        // The client's sealing key must interoperate with the server's
        // opening key built from the same material.
        let client = compute_keys::<sha2::Sha256>(shared, &h, &h, &names, false).unwrap();
        let server = compute_keys::<sha2::Sha256>(shared, &h, &h, &names, true).unwrap();

        let mut counters_out = crate::sshbuf::StreamCounters::default();
        let mut counters_in = crate::sshbuf::StreamCounters::default();
        let pool = crate::sshbuf::BufPool::new();
        let seg_pool = crate::sshbuf::SegmentPool::new();
        let mut wire = crate::sshbuf::Sequence::new(seg_pool);

        let mut sealed = SecureVec::new();
        let mut sealing = client.local_to_remote;
        let mut opening = server.remote_to_local;
        sealing.write(b"interop check", &mut counters_out, &mut sealed);
        wire.extend(&sealed);

        let packet = crate::cipher::try_decode(
            &mut wire,
            &mut counters_in,
            &mut *opening,
            crate::cipher::DEFAULT_MAX_PACKET_LEN,
            &pool,
        )
        .unwrap()
        .unwrap();
        assert_eq!(packet.payload(), b"interop check");
    }

    #[test]
    fn exchange_hash_covers_every_field() {
        let mut ex = Exchange::new(b"SSH-2.0-a", b"SSH-2.0-b");
        ex.client_kex_init.extend(b"cki");
        ex.server_kex_init.extend(b"ski");
        ex.client_ephemeral.extend(&[1; 32]);
        ex.server_ephemeral.extend(&[2; 32]);

        let h1 = hash_exchange::<sha2::Sha256>(b"hostkey", &ex, b"K").unwrap();
        let mut ex2 = ex.clone();
        ex2.server_ephemeral.clear();
        ex2.server_ephemeral.extend(&[3; 32]);
        let h2 = hash_exchange::<sha2::Sha256>(b"hostkey", &ex2, b"K").unwrap();
        assert_ne!(&h1[..], &h2[..]);
        assert_eq!(h1.len(), 32);
    }
}
