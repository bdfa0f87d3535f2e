use digest::Digest;
use hex_literal::hex;
use num_bigint::{BigUint, RandBigInt};
use sha2::{Sha256, Sha512};
use ssh_encoding::Encode;

use super::{compute_keys, Exchange, KexAlgorithm, KexType};
use crate::cipher::CipherPair;
use crate::negotiation::Names;
use crate::wire::encode_mpint;
use crate::{msg, Error, SecureVec};

pub struct DhGroup {
    prime: &'static [u8],
    generator: u8,
}

// RFC 3526 section 3.
const DH_GROUP14: DhGroup = DhGroup {
    prime: &hex!(
        "
        FFFFFFFF FFFFFFFF C90FDAA2 2168C234 C4C6628B 80DC1CD1
        29024E08 8A67CC74 020BBEA6 3B139B22 514A0879 8E3404DD
        EF9519B3 CD3A431B 302B0A6D F25F1437 4FE1356D 6D51C245
        E485B576 625E7EC6 F44C42E9 A637ED6B 0BFF5CB6 F406B7ED
        EE386BFB 5A899FA5 AE9F2411 7C4B1FE6 49286651 ECE45B3D
        C2007CB8 A163BF05 98DA4836 1C55D39A 69163FA8 FD24CF5F
        83655D23 DCA3AD96 1C62F356 208552BB 9ED52907 7096966D
        670C354E 4ABC9804 F1746C08 CA18217C 32905E46 2E36CE3B
        E39E772C 180E8603 9B2783A2 EC07A28F B5C55DF0 6F4C52C9
        DE2BCBF6 95581718 3995497C EA956AE5 15D22618 98FA0510
        15728E5A 8AACAA68 FFFFFFFF FFFFFFFF
        "
    ),
    generator: 2,
};

// RFC 3526 section 5.
const DH_GROUP16: DhGroup = DhGroup {
    prime: &hex!(
        "
        FFFFFFFF FFFFFFFF C90FDAA2 2168C234 C4C6628B 80DC1CD1
        29024E08 8A67CC74 020BBEA6 3B139B22 514A0879 8E3404DD
        EF9519B3 CD3A431B 302B0A6D F25F1437 4FE1356D 6D51C245
        E485B576 625E7EC6 F44C42E9 A637ED6B 0BFF5CB6 F406B7ED
        EE386BFB 5A899FA5 AE9F2411 7C4B1FE6 49286651 ECE45B3D
        C2007CB8 A163BF05 98DA4836 1C55D39A 69163FA8 FD24CF5F
        83655D23 DCA3AD96 1C62F356 208552BB 9ED52907 7096966D
        670C354E 4ABC9804 F1746C08 CA18217C 32905E46 2E36CE3B
        E39E772C 180E8603 9B2783A2 EC07A28F B5C55DF0 6F4C52C9
        DE2BCBF6 95581718 3995497C EA956AE5 15D22618 98FA0510
        15728E5A 8AAAC42D AD33170D 04507A33 A85521AB DF1CBA64
        ECFB8504 58DBEF0A 8AEA7157 5D060C7D B3970F85 A6E1E4C7
        ABF5AE8C DB0933D7 1E8C94E0 4A25619D CEE3D226 1AD2EE6B
        F12FFA06 D98A0864 D8760273 3EC86A64 521F2B18 177B200C
        BBE11757 7A615D6C 770988C0 BAD946E2 08E24FA0 74E5AB31
        43DB5BFC E0FD108E 4B82D120 A9210801 1A723C12 A787E6D7
        88719A10 BDBA5B26 99C32718 6AF4E23C 1A946834 B6150BDA
        2583E9CA 2AD44CE8 DBBBC2DB 04DE8EF9 2E8EFC14 1FBECAA6
        287C5947 4E6BC05D 99B2964F A090C3A2 233BA186 515BE7ED
        1F612970 CEE2D7AF B81BDD76 2170481C D0069127 D5B05AA9
        93B4EA98 8D8FDDC1 86FFB7DC 90A6C08F 4DF435C9 34063199
        FFFFFFFF FFFFFFFF
        "
    ),
    generator: 2,
};

pub struct DhGroup14Sha256KexType {}

impl KexType for DhGroup14Sha256KexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send> {
        Box::new(DhGroupKex::<Sha256>::new(&DH_GROUP14))
    }
}

pub struct DhGroup16Sha512KexType {}

impl KexType for DhGroup16Sha512KexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send> {
        Box::new(DhGroupKex::<Sha512>::new(&DH_GROUP16))
    }
}

pub struct DhGroupKex<D: Digest> {
    prime: BigUint,
    generator: BigUint,
    private_key: Option<BigUint>,
    shared_mpint: Option<SecureVec>,
    _digest: std::marker::PhantomData<D>,
}

impl<D: Digest> DhGroupKex<D> {
    fn new(group: &DhGroup) -> Self {
        DhGroupKex {
            prime: BigUint::from_bytes_be(group.prime),
            generator: BigUint::from(group.generator),
            private_key: None,
            shared_mpint: None,
            _digest: std::marker::PhantomData,
        }
    }

    fn in_group_range(&self, key: &BigUint) -> bool {
        let one = BigUint::from(1u8);
        key > &one && key < &(&self.prime - &one)
    }
}

impl<D: Digest> std::fmt::Debug for DhGroupKex<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Algorithm {{ local_secret: [hidden], shared_secret: [hidden] }}",
        )
    }
}

impl<D: Digest + Send> KexAlgorithm for DhGroupKex<D> {
    fn client_dh(
        &mut self,
        client_ephemeral: &mut SecureVec,
        writer: &mut SecureVec,
    ) -> Result<(), Error> {
        let q = (&self.prime - &BigUint::from(1u8)) / &BigUint::from(2u8);
        let private = rand::thread_rng().gen_biguint_range(&BigUint::from(2u8), &q);
        let public = self.generator.modpow(&private, &self.prime);

        client_ephemeral.clear();
        client_ephemeral.extend(&public.to_bytes_be());

        // KEXDH_INIT shares its number with KEX_ECDH_INIT; e is an mpint.
        msg::KEX_ECDH_INIT.encode(writer)?;
        encode_mpint(&public.to_bytes_be(), writer)?;

        self.private_key = Some(private);
        Ok(())
    }

    fn compute_shared_secret(&mut self, remote_pubkey: &[u8]) -> Result<(), Error> {
        let private = self.private_key.take().ok_or(Error::Kex)?;
        let server_public = BigUint::from_bytes_be(remote_pubkey);
        if !self.in_group_range(&server_public) {
            return Err(Error::Kex);
        }
        let shared = server_public.modpow(&private, &self.prime);
        if !self.in_group_range(&shared) {
            return Err(Error::Kex);
        }

        let mut encoded = SecureVec::new();
        encode_mpint(&shared.to_bytes_be(), &mut encoded)?;
        self.shared_mpint = Some(encoded);
        Ok(())
    }

    fn compute_exchange_hash(
        &self,
        server_host_key: &[u8],
        exchange: &Exchange,
    ) -> Result<SecureVec, Error> {
        let shared = self.shared_mpint.as_ref().ok_or(Error::Kex)?;

        // https://tools.ietf.org/html/rfc4253#section-8: e and f are
        // hashed as mpints, unlike the ECDH octet strings.
        let mut buffer = SecureVec::new();
        exchange.client_id.as_ref().encode(&mut buffer)?;
        exchange.server_id.as_ref().encode(&mut buffer)?;
        exchange.client_kex_init.as_ref().encode(&mut buffer)?;
        exchange.server_kex_init.as_ref().encode(&mut buffer)?;
        server_host_key.encode(&mut buffer)?;
        encode_mpint(&exchange.client_ephemeral, &mut buffer)?;
        encode_mpint(&exchange.server_ephemeral, &mut buffer)?;
        buffer.extend(shared);

        let mut res = SecureVec::new();
        res.extend(&D::digest(&buffer));
        Ok(res)
    }

    fn compute_keys(
        &self,
        session_id: &SecureVec,
        exchange_hash: &SecureVec,
        names: &Names,
        is_server: bool,
    ) -> Result<CipherPair, Error> {
        let shared = self.shared_mpint.as_ref().ok_or(Error::Kex)?;
        compute_keys::<D>(shared, session_id, exchange_hash, names, is_server)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rejects_degenerate_server_publics() {
        let mut kex = DhGroupKex::<Sha256>::new(&DH_GROUP14);
        let mut eph = SecureVec::new();
        let mut sink = SecureVec::new();
        kex.client_dh(&mut eph, &mut sink).unwrap();
        assert!(kex.compute_shared_secret(&[1]).is_err());

        let mut kex = DhGroupKex::<Sha256>::new(&DH_GROUP14);
        kex.client_dh(&mut eph, &mut sink).unwrap();
        assert!(kex.compute_shared_secret(DH_GROUP14.prime).is_err());
    }

    #[test]
    fn group14_shared_secret_agrees() {
        let mut alice = DhGroupKex::<Sha256>::new(&DH_GROUP14);
        let mut bob = DhGroupKex::<Sha256>::new(&DH_GROUP14);

        let mut alice_eph = SecureVec::new();
        let mut bob_eph = SecureVec::new();
        let mut sink = SecureVec::new();
        alice.client_dh(&mut alice_eph, &mut sink).unwrap();
        bob.client_dh(&mut bob_eph, &mut sink).unwrap();

        alice.compute_shared_secret(&bob_eph).unwrap();
        bob.compute_shared_secret(&alice_eph).unwrap();
        assert_eq!(alice.shared_mpint, bob.shared_mpint);
    }
}
