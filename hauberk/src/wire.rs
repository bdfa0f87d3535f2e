//! Helpers for the SSH wire primitives that `ssh_encoding` does not cover
//! directly: comma-joined name-lists and the mpint sign rules.

use std::fmt::Debug;

use ssh_encoding::{Decode, Encode, Writer};

use crate::Error;

/// Map any decode error onto [`Error::MalformedPacket`]. Used when parsing
/// packet payloads, where a truncated read is a peer fault rather than a
/// local encoding bug.
pub(crate) fn malformed<E>(_: E) -> Error {
    Error::MalformedPacket
}

/// An SSH `name-list`: a `string` holding comma-separated ASCII names.
pub struct NameList(pub Vec<String>);

impl Debug for NameList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl NameList {
    pub fn as_encoded_string(&self) -> String {
        self.0.join(",")
    }

    pub fn from_encoded_string(value: &str) -> Self {
        Self(value.split(',').map(|x| x.to_string()).collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|x| x == name)
    }
}

impl Encode for NameList {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        self.as_encoded_string().encoded_len()
    }

    fn encode(&self, writer: &mut impl Writer) -> Result<(), ssh_encoding::Error> {
        self.as_encoded_string().encode(writer)
    }
}

impl Decode for NameList {
    type Error = ssh_encoding::Error;

    fn decode(reader: &mut impl ssh_encoding::Reader) -> Result<Self, Self::Error> {
        let s = String::decode(reader)?;
        Ok(Self::from_encoded_string(&s))
    }
}

/// Encode `s` as an SSH `mpint`: leading zero octets are dropped, a 0x00 is
/// prepended when the top bit would otherwise flip the sign, and zero is the
/// empty string.
pub(crate) fn encode_mpint<W: Writer>(s: &[u8], w: &mut W) -> Result<(), Error> {
    // Skip initial 0s.
    let mut i = 0;
    while i < s.len() && s.get(i) == Some(&0) {
        i += 1
    }
    match s.get(i) {
        None => {
            // mpint 0 is the empty string
            0u32.encode(w)?;
        }
        Some(first) if first & 0x80 != 0 => {
            ((s.len() - i + 1) as u32).encode(w)?;
            0u8.encode(w)?;
            w.write(s.get(i..).unwrap_or_default())?;
        }
        Some(_) => {
            ((s.len() - i) as u32).encode(w)?;
            w.write(s.get(i..).unwrap_or_default())?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn mpint(s: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_mpint(s, &mut out).unwrap();
        out
    }

    #[test]
    fn mpint_zero_is_empty() {
        assert_eq!(mpint(&[]), &[0, 0, 0, 0]);
        assert_eq!(mpint(&[0, 0, 0]), &[0, 0, 0, 0]);
    }

    #[test]
    fn mpint_drops_leading_zeros() {
        assert_eq!(mpint(&[0, 0, 0x7f, 0x01]), &[0, 0, 0, 2, 0x7f, 0x01]);
    }

    #[test]
    fn mpint_keeps_sign_positive() {
        // RFC 4251 section 5: 0x80 needs a leading zero octet.
        assert_eq!(mpint(&[0x80]), &[0, 0, 0, 2, 0x00, 0x80]);
        assert_eq!(mpint(&[0x7f]), &[0, 0, 0, 1, 0x7f]);
    }

    #[test]
    fn name_list_round_trip() {
        let l = NameList::from_encoded_string("curve25519-sha256,ecdh-sha2-nistp256");
        assert_eq!(l.0.len(), 2);
        assert!(l.contains("ecdh-sha2-nistp256"));
        assert_eq!(
            l.as_encoded_string(),
            "curve25519-sha256,ecdh-sha2-nistp256"
        );

        let mut out = Vec::new();
        l.encode(&mut out).unwrap();
        let back = NameList::decode(&mut &out[..]).unwrap();
        assert_eq!(back.0, l.0);
    }

    #[test]
    fn truncated_string_is_malformed() {
        let buf: &[u8] = &[0, 0, 0, 10, b'x'];
        let r = String::decode(&mut &buf[..]).map_err(malformed);
        assert!(matches!(r, Err(Error::MalformedPacket)));
    }
}
