use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use ssh_encoding::Encode;

use super::{compute_keys, hash_exchange, Exchange, KexAlgorithm, KexType};
use crate::cipher::CipherPair;
use crate::negotiation::Names;
use crate::wire::encode_mpint;
use crate::{msg, Error, SecureVec};

pub struct EcdhNistP256KexType {}

impl KexType for EcdhNistP256KexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send> {
        Box::new(EcdhNistP256Kex {
            local_secret: None,
            shared_mpint: None,
        })
    }
}

// https://tools.ietf.org/html/rfc5656#section-4: Q_C/Q_S are uncompressed
// SEC1 points, K is the x coordinate as an mpint.
pub struct EcdhNistP256Kex {
    local_secret: Option<EphemeralSecret>,
    shared_mpint: Option<SecureVec>,
}

impl std::fmt::Debug for EcdhNistP256Kex {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Algorithm {{ local_secret: [hidden], shared_secret: [hidden] }}",
        )
    }
}

impl KexAlgorithm for EcdhNistP256Kex {
    fn client_dh(
        &mut self,
        client_ephemeral: &mut SecureVec,
        writer: &mut SecureVec,
    ) -> Result<(), Error> {
        let client_secret = EphemeralSecret::random(&mut rand::rngs::OsRng);
        let client_pubkey = client_secret.public_key().to_encoded_point(false);

        client_ephemeral.clear();
        client_ephemeral.extend(client_pubkey.as_bytes());

        msg::KEX_ECDH_INIT.encode(writer)?;
        client_pubkey.as_bytes().encode(writer)?;

        self.local_secret = Some(client_secret);
        Ok(())
    }

    fn compute_shared_secret(&mut self, remote_pubkey: &[u8]) -> Result<(), Error> {
        let local_secret = self.local_secret.take().ok_or(Error::Kex)?;
        let remote = p256::PublicKey::from_sec1_bytes(remote_pubkey).map_err(|_| Error::Kex)?;
        let shared = local_secret.diffie_hellman(&remote);

        let mut encoded = SecureVec::new();
        encode_mpint(shared.raw_secret_bytes(), &mut encoded)?;
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
