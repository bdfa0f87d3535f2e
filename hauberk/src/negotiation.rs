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
use std::borrow::Cow;

use log::debug;
use rand::RngCore;
use ssh_encoding::{Decode, Encode};
use ssh_key::{Algorithm, EcdsaCurve, HashAlg};

use crate::cipher::CIPHERS;
use crate::wire::NameList;
use crate::{cipher, compression, kex, mac, msg, AlgorithmKind, Error, SecureVec};

/// The outcome of algorithm negotiation: one algorithm per category, per
/// direction where the protocol distinguishes directions.
#[derive(Debug, Clone)]
pub struct Names {
    pub kex: kex::Name,
    pub host_key: Algorithm,
    pub cipher_c2s: cipher::Name,
    pub cipher_s2c: cipher::Name,
    pub mac_c2s: mac::Name,
    pub mac_s2c: mac::Name,
    pub comp_c2s: compression::Name,
    pub comp_s2c: compression::Name,
    /// The peer announced a guessed KEX packet that guessed wrong; the next
    /// KEX message must be discarded.
    pub(crate) ignore_guessed: bool,
}

/// Lists of preferred algorithms. This is normally hard-coded into
/// implementations.
#[derive(Debug, Clone)]
pub struct Preferred {
    /// Preferred key exchange algorithms.
    pub kex: Cow<'static, [kex::Name]>,
    /// Preferred host key algorithms.
    pub host_key: Cow<'static, [Algorithm]>,
    /// Preferred symmetric ciphers.
    pub cipher: Cow<'static, [cipher::Name]>,
    /// Preferred MAC algorithms.
    pub mac: Cow<'static, [mac::Name]>,
    /// Preferred compression algorithms.
    pub compression: Cow<'static, [compression::Name]>,
}

const SAFE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
];

const CIPHER_ORDER: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_128_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

const HMAC_ORDER: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA1,
];

const COMPRESSION_ORDER: &[compression::Name] = &[compression::NONE];

impl Preferred {
    pub const DEFAULT: Preferred = Preferred {
        kex: Cow::Borrowed(SAFE_KEX_ORDER),
        host_key: Cow::Borrowed(&[
            Algorithm::Ed25519,
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha512),
            },
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha256),
            },
        ]),
        cipher: Cow::Borrowed(CIPHER_ORDER),
        mac: Cow::Borrowed(HMAC_ORDER),
        compression: Cow::Borrowed(COMPRESSION_ORDER),
    };
}

impl Default for Preferred {
    fn default() -> Preferred {
        Preferred::DEFAULT
    }
}

/// Pick the first of our algorithms that the server also supports
/// (https://tools.ietf.org/html/rfc4253#section-7.1: the client's
/// preference wins).
fn select<S: AsRef<str> + Clone>(
    ours: &[S],
    theirs: &NameList,
    kind: AlgorithmKind,
) -> Result<S, Error> {
    for ours_candidate in ours {
        if theirs.contains(ours_candidate.as_ref()) {
            return Ok(ours_candidate.clone());
        }
    }
    Err(Error::NoCommonAlgorithm {
        kind,
        ours: ours.iter().map(|x| x.as_ref().to_owned()).collect(),
        theirs: theirs.0.clone(),
    })
}

/// Parse the server's KEXINIT payload and negotiate every category against
/// `pref`. `buffer` is the whole payload including the message byte.
pub(crate) fn read_kex(buffer: &[u8], pref: &Preferred) -> Result<Names, Error> {
    use crate::wire::malformed;

    // message byte + 16 cookie bytes
    let r = &mut buffer.get(17..).ok_or(Error::MalformedPacket)?;

    let kex_list = NameList::decode(r).map_err(malformed)?;
    let host_key_list = NameList::decode(r).map_err(malformed)?;
    let cipher_c2s_list = NameList::decode(r).map_err(malformed)?;
    let cipher_s2c_list = NameList::decode(r).map_err(malformed)?;
    let mac_c2s_list = NameList::decode(r).map_err(malformed)?;
    let mac_s2c_list = NameList::decode(r).map_err(malformed)?;
    let comp_c2s_list = NameList::decode(r).map_err(malformed)?;
    let comp_s2c_list = NameList::decode(r).map_err(malformed)?;
    let _lang_c2s = NameList::decode(r).map_err(malformed)?;
    let _lang_s2c = NameList::decode(r).map_err(malformed)?;
    let follows = u8::decode(r).map_err(malformed)? != 0;

    let kex = select(&pref.kex, &kex_list, AlgorithmKind::Kex)?;
    let host_key = select(&pref.host_key, &host_key_list, AlgorithmKind::HostKey)?;

    let cipher_c2s = select(&pref.cipher, &cipher_c2s_list, AlgorithmKind::Cipher)?;
    let cipher_s2c = select(&pref.cipher, &cipher_s2c_list, AlgorithmKind::Cipher)?;

    let select_mac = |list: &NameList, cipher: &cipher::Name| -> Result<mac::Name, Error> {
        let needs_mac = CIPHERS
            .get(cipher)
            .map(|c| c.needs_mac())
            .unwrap_or(false);
        match select(&pref.mac, list, AlgorithmKind::Mac) {
            Ok(m) => Ok(m),
            Err(_) if !needs_mac => Ok(mac::NONE),
            Err(e) => Err(e),
        }
    };
    let mac_c2s = select_mac(&mac_c2s_list, &cipher_c2s)?;
    let mac_s2c = select_mac(&mac_s2c_list, &cipher_s2c)?;

    let comp_c2s = select(&pref.compression, &comp_c2s_list, AlgorithmKind::Compression)?;
    let comp_s2c = select(&pref.compression, &comp_s2c_list, AlgorithmKind::Compression)?;

    // The guess was right only if both sides' first choices agree.
    let guessed_right = kex_list.0.first().map(|s| s.as_str()) == Some(kex.as_ref())
        && host_key_list.0.first().map(|s| s.as_str()) == Some(host_key.as_ref())
        && pref.kex.first().map(|k| k.as_ref()) == Some(kex.as_ref())
        && pref.host_key.first().map(|k| k.as_ref()) == Some(host_key.as_ref());

    let names = Names {
        kex,
        host_key,
        cipher_c2s,
        cipher_s2c,
        mac_c2s,
        mac_s2c,
        comp_c2s,
        comp_s2c,
        ignore_guessed: follows && !guessed_right,
    };
    debug!("negotiated: {names:?}");
    Ok(names)
}

/// Build our KEXINIT payload (message byte included) and return it, since
/// the exchange hash needs the exact bytes later.
pub(crate) fn write_kex(prefs: &Preferred) -> Result<SecureVec, Error> {
    let mut buf = SecureVec::new();
    buf.push(msg::KEXINIT);

    let mut cookie = [0; 16];
    rand::thread_rng().fill_bytes(&mut cookie);
    buf.extend(&cookie);

    let name_list = |items: &[&str]| NameList(items.iter().map(|s| s.to_string()).collect());

    name_list(&prefs.kex.iter().map(AsRef::as_ref).collect::<Vec<_>>()).encode(&mut buf)?;
    name_list(
        &prefs
            .host_key
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>(),
    )
    .encode(&mut buf)?;

    let ciphers = name_list(&prefs.cipher.iter().map(AsRef::as_ref).collect::<Vec<_>>());
    ciphers.encode(&mut buf)?; // client to server
    ciphers.encode(&mut buf)?; // server to client

    let macs = name_list(&prefs.mac.iter().map(AsRef::as_ref).collect::<Vec<_>>());
    macs.encode(&mut buf)?; // client to server
    macs.encode(&mut buf)?; // server to client

    let comps = name_list(
        &prefs
            .compression
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>(),
    );
    comps.encode(&mut buf)?; // client to server
    comps.encode(&mut buf)?; // server to client

    "".encode(&mut buf)?; // languages client to server
    "".encode(&mut buf)?; // languages server to client

    buf.push(0); // doesn't follow
    buf.extend(&[0, 0, 0, 0]); // reserved
    Ok(buf)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn server_kexinit(kex: &str, cipher: &str) -> Vec<u8> {
        let mut buf = SecureVec::new();
        buf.push(msg::KEXINIT);
        buf.extend(&[0; 16]);
        for list in [
            kex,
            "ssh-ed25519,rsa-sha2-512",
            cipher,
            cipher,
            "hmac-sha2-256,hmac-sha2-256-etm@openssh.com",
            "hmac-sha2-256",
            "none",
            "none",
            "",
            "",
        ] {
            NameList::from_encoded_string(list).encode(&mut buf).unwrap();
        }
        buf.push(0);
        buf.extend(&[0, 0, 0, 0]);
        buf.to_vec()
    }

    #[test]
    fn picks_our_first_common_choice() {
        let payload = server_kexinit(
            "diffie-hellman-group14-sha256,curve25519-sha256",
            "aes256-ctr,chacha20-poly1305@openssh.com",
        );
        let names = read_kex(&payload, &Preferred::DEFAULT).unwrap();
        // Ours lead with curve25519 and chacha20; the server's ordering
        // does not matter.
        assert_eq!(names.kex.as_ref(), "curve25519-sha256");
        assert_eq!(names.cipher_c2s.as_ref(), "chacha20-poly1305@openssh.com");
        assert_eq!(names.cipher_s2c.as_ref(), "chacha20-poly1305@openssh.com");
        assert_eq!(names.mac_c2s.as_ref(), "hmac-sha2-256-etm@openssh.com");
        assert_eq!(names.mac_s2c.as_ref(), "hmac-sha2-256");
        assert_eq!(names.host_key.as_ref(), "ssh-ed25519");
    }

    #[test]
    fn no_intersection_is_an_error() {
        let payload = server_kexinit("diffie-hellman-group1-sha1", "aes256-ctr");
        let err = read_kex(&payload, &Preferred::DEFAULT).unwrap_err();
        match err {
            Error::NoCommonAlgorithm { kind, .. } => assert_eq!(kind, AlgorithmKind::Kex),
            e => panic!("unexpected error: {e:?}"),
        }
    }

    #[test]
    fn own_kexinit_parses_against_itself() {
        let ours = write_kex(&Preferred::DEFAULT).unwrap();
        let names = read_kex(&ours, &Preferred::DEFAULT).unwrap();
        assert_eq!(names.kex.as_ref(), "curve25519-sha256");
        assert!(!names.ignore_guessed);
    }
}
