use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use ssh_encoding::Encode;

use super::{compute_keys, hash_exchange, Exchange, KexAlgorithm, KexType};
use crate::cipher::CipherPair;
use crate::negotiation::Names;
use crate::wire::encode_mpint;
use crate::{msg, Error, SecureVec};

pub struct Curve25519KexType {}

impl KexType for Curve25519KexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send> {
        Box::new(Curve25519Kex {
            local_secret: None,
            shared_mpint: None,
        })
    }
}

pub struct Curve25519Kex {
    local_secret: Option<Scalar>,
    shared_mpint: Option<SecureVec>,
}

impl std::fmt::Debug for Curve25519Kex {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Algorithm {{ local_secret: [hidden], shared_secret: [hidden] }}",
        )
    }
}

impl KexAlgorithm for Curve25519Kex {
    fn client_dh(
        &mut self,
        client_ephemeral: &mut SecureVec,
        writer: &mut SecureVec,
    ) -> Result<(), Error> {
        let client_secret = Scalar::from_bytes_mod_order(rand::random::<[u8; 32]>());
        let client_pubkey = (ED25519_BASEPOINT_TABLE * &client_secret).to_montgomery();

        client_ephemeral.clear();
        client_ephemeral.extend(&client_pubkey.0);

        msg::KEX_ECDH_INIT.encode(writer)?;
        client_pubkey.0.encode(writer)?;

        self.local_secret = Some(client_secret);
        Ok(())
    }

    fn compute_shared_secret(&mut self, remote_pubkey: &[u8]) -> Result<(), Error> {
        let local_secret = self.local_secret.take().ok_or(Error::Kex)?;
        if remote_pubkey.len() != 32 {
            return Err(Error::Kex);
        }
        let mut pubkey = MontgomeryPoint([0; 32]);
        pubkey.0.clone_from_slice(remote_pubkey);

        let shared = local_secret * pubkey;
        let mut encoded = SecureVec::new();
        encode_mpint(&shared.0, &mut encoded)?;
        self.shared_mpint = Some(encoded);
        Ok(())
    }

    fn compute_exchange_hash(
        &self,
        server_host_key: &[u8],
        exchange: &Exchange,
    ) -> Result<SecureVec, Error> {
        let shared = self.shared_mpint.as_ref().ok_or(Error::Kex)?;
        hash_exchange::<sha2::Sha256>(server_host_key, exchange, shared)
    }

    fn compute_keys(
        &self,
        session_id: &SecureVec,
        exchange_hash: &SecureVec,
        names: &Names,
        is_server: bool,
    ) -> Result<CipherPair, Error> {
        let shared = self.shared_mpint.as_ref().ok_or(Error::Kex)?;
        compute_keys::<sha2::Sha256>(shared, session_id, exchange_hash, names, is_server)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree_on_the_shared_secret() {
        let mut alice = Curve25519Kex {
            local_secret: None,
            shared_mpint: None,
        };
        let mut bob = Curve25519Kex {
            local_secret: None,
            shared_mpint: None,
        };

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
