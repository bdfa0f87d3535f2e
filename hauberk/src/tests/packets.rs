//! Packet codec invariants: encode/decode fidelity, sequence numbering,
//! tamper detection, and the length bounds.

use std::sync::Arc;

use crate::cipher::{self, try_decode, Cipher, OpeningKey, SealingKey, CIPHERS};
use crate::mac::{self, MacAlgorithm, MACS};
use crate::sshbuf::{BufPool, SegmentPool, Sequence, StreamCounters};
use crate::{Error, SecureVec};

use super::test_init;

struct Codec {
    sealing: Box<dyn SealingKey + Send>,
    opening: Box<dyn OpeningKey + Send>,
    out_counters: StreamCounters,
    in_counters: StreamCounters,
    wire: Sequence,
    pool: Arc<BufPool>,
}

fn codec_for(cipher_name: &cipher::Name, mac_name: &mac::Name) -> Codec {
    let cipher = CIPHERS.get(cipher_name).unwrap();
    let mac = MACS.get(mac_name).unwrap();

    let key: Vec<u8> = (0..cipher.key_len()).map(|i| i as u8).collect();
    let iv: Vec<u8> = (0..cipher.iv_len()).map(|i| (i * 3 + 1) as u8).collect();
    let mac_key: Vec<u8> = (0..mac.key_len()).map(|i| (i * 7 + 5) as u8).collect();

    Codec {
        sealing: cipher.make_sealing_key(&key, &iv, &mac_key, *mac),
        opening: cipher.make_opening_key(&key, &iv, &mac_key, *mac),
        out_counters: StreamCounters::default(),
        in_counters: StreamCounters::default(),
        wire: Sequence::new(SegmentPool::new()),
        pool: BufPool::new(),
    }
}

/// Every cipher/MAC pairing the negotiator can produce.
fn all_codecs() -> Vec<(cipher::Name, mac::Name)> {
    vec![
        (cipher::NONE, mac::NONE),
        (cipher::AES_128_CTR, mac::HMAC_SHA1),
        (cipher::AES_192_CTR, mac::HMAC_SHA256),
        (cipher::AES_256_CTR, mac::HMAC_SHA512),
        (cipher::AES_256_CTR, mac::HMAC_SHA256_ETM),
        (cipher::AES_128_CTR, mac::HMAC_SHA512_ETM),
        (cipher::AES_128_GCM, mac::NONE),
        (cipher::AES_256_GCM, mac::NONE),
        (cipher::CHACHA20_POLY1305, mac::NONE),
    ]
}

impl Codec {
    fn seal(&mut self, payload: &[u8]) -> usize {
        let mut buf = SecureVec::new();
        self.sealing.write(payload, &mut self.out_counters, &mut buf);
        self.wire.extend(&buf);
        buf.len()
    }

    fn decode(&mut self) -> Result<Option<Vec<u8>>, Error> {
        Ok(try_decode(
            &mut self.wire,
            &mut self.in_counters,
            &mut *self.opening,
            cipher::DEFAULT_MAX_PACKET_LEN,
            &self.pool,
        )?
        .map(|p| p.payload().to_vec()))
    }
}

#[test]
fn decode_encode_fidelity_and_sequence_numbers() {
    test_init();
    for (cipher_name, mac_name) in all_codecs() {
        let mut codec = codec_for(&cipher_name, &mac_name);
        let payloads: Vec<Vec<u8>> = vec![
            vec![21],
            b"a longer payload that spans more than one cipher block for sure".to_vec(),
            (0..1000u32).flat_map(|i| i.to_be_bytes()).collect(),
        ];
        for (i, payload) in payloads.iter().enumerate() {
            codec.seal(payload);
            let decoded = codec.decode().unwrap().unwrap_or_else(|| {
                panic!("{}/{}: no packet", cipher_name.as_ref(), mac_name.as_ref())
            });
            assert_eq!(
                &decoded,
                payload,
                "{}/{} round trip",
                cipher_name.as_ref(),
                mac_name.as_ref()
            );
            // Sequence numbers count 0, 1, 2, ... on both sides.
            assert_eq!(codec.out_counters.seqn.0 as usize, i + 1);
            assert_eq!(codec.in_counters.seqn.0 as usize, i + 1);
        }
        assert!(codec.wire.is_empty());
    }
}

#[test]
fn partial_frames_are_pending() {
    test_init();
    for (cipher_name, mac_name) in all_codecs() {
        let mut codec = codec_for(&cipher_name, &mac_name);
        let mut buf = SecureVec::new();
        codec
            .sealing
            .write(b"split delivery", &mut codec.out_counters, &mut buf);

        // Deliver all but the last byte: must stay pending without
        // consuming anything.
        codec.wire.extend(&buf[..buf.len() - 1]);
        assert!(codec.decode().unwrap().is_none());
        assert_eq!(codec.wire.len(), buf.len() - 1);
        assert_eq!(codec.in_counters.seqn.0, 0);

        codec.wire.extend(&buf[buf.len() - 1..]);
        assert_eq!(codec.decode().unwrap().unwrap(), b"split delivery");
    }
}

#[test]
fn tampering_is_detected_and_nothing_is_consumed() {
    test_init();
    for (cipher_name, mac_name) in all_codecs() {
        if cipher_name == cipher::NONE {
            continue;
        }
        let mut codec = codec_for(&cipher_name, &mac_name);
        let mut buf = SecureVec::new();
        codec
            .sealing
            .write(b"bytes under protection", &mut codec.out_counters, &mut buf);

        // Flip one bit somewhere in the body (never the length field for
        // plaintext-length codecs, which would shift framing instead).
        let idx = buf.len() / 2;
        buf[idx] ^= 0x10;
        let len = buf.len();
        codec.wire.extend(&buf);

        let err = codec.decode().unwrap_err();
        assert!(
            matches!(err, Error::IntegrityFailure),
            "{}/{}: expected IntegrityFailure, got {err:?}",
            cipher_name.as_ref(),
            mac_name.as_ref()
        );
        // Nothing was consumed on the error path.
        assert_eq!(codec.wire.len(), len);
        assert_eq!(codec.in_counters.seqn.0, 0);
    }
}

#[test]
fn wrong_sequence_number_fails_integrity() {
    test_init();
    // The MAC covers the sequence number; a receiver out of step must
    // reject the packet.
    let mut codec = codec_for(&cipher::AES_256_CTR, &mac::HMAC_SHA256);
    codec.seal(b"first");
    codec.in_counters.advance(0);
    assert!(matches!(codec.decode(), Err(Error::IntegrityFailure)));
}

#[test]
fn declared_length_beyond_max_is_packet_too_long() {
    test_init();
    // Plaintext length field: forge a huge declared length.
    let mut codec = codec_for(&cipher::NONE, &mac::NONE);
    let forged = (cipher::DEFAULT_MAX_PACKET_LEN as u32 + 1).to_be_bytes();
    codec.wire.extend(&forged);
    match codec.decode() {
        Err(Error::PacketTooLong(n)) => assert_eq!(n, cipher::DEFAULT_MAX_PACKET_LEN + 1),
        other => panic!("expected PacketTooLong, got {other:?}"),
    }

    // The hard cap applies even when the caller raises max_packet_len.
    let mut codec = codec_for(&cipher::NONE, &mac::NONE);
    codec.wire.extend(&(1u32 << 20).to_be_bytes());
    let r = try_decode(
        &mut codec.wire,
        &mut codec.in_counters,
        &mut *codec.opening,
        usize::MAX,
        &codec.pool,
    );
    assert!(matches!(r, Err(Error::PacketTooLong(_))));
}

#[test]
fn misaligned_length_is_bad_length() {
    test_init();
    let mut codec = codec_for(&cipher::NONE, &mac::NONE);
    // 13 is not 4 short of a multiple of 8.
    codec.wire.extend(&13u32.to_be_bytes());
    assert!(matches!(codec.decode(), Err(Error::BadLength)));
}

#[test]
fn payloads_at_the_maximum_survive() {
    test_init();
    let mut codec = codec_for(&cipher::CHACHA20_POLY1305, &mac::NONE);
    let payload = vec![0xa5u8; 32 * 1024];
    codec.seal(&payload);
    assert_eq!(codec.decode().unwrap().unwrap(), payload);
}
