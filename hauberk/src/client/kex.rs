//! The client side of the key exchange, split so the connect driver can
//! gate on host-key verification after the server's signature checks out
//! but before NEWKEYS commits the new keys.

use log::{debug, error};
use signature::Verifier;
use ssh_encoding::Decode;
use ssh_key::{PublicKey, Signature};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::kex::{Exchange, KexAlgorithm, KexType, KEXES};
use crate::negotiation::{read_kex, write_kex, Preferred};
use crate::sshbuf::Packet;
use crate::transport::Transport;
use crate::wire::malformed;
use crate::{msg, Error, Names, SecureVec};

/// Why this exchange is running: the first KEX binds the session id, a
/// rekey reuses it.
pub(crate) enum KexCause {
    Initial,
    Rekey { session_id: SecureVec },
}

impl KexCause {
    fn session_id(&self) -> Option<&SecureVec> {
        match self {
            KexCause::Initial => None,
            KexCause::Rekey { session_id } => Some(session_id),
        }
    }
}

/// A completed exchange, verified but not yet committed: NEWKEYS has not
/// been sent. [`PendingKex::finish`] performs the switchover.
pub(crate) struct PendingKex {
    pub names: Names,
    pub server_host_key: PublicKey,
    pub exchange_hash: SecureVec,
    pub session_id: SecureVec,
    kex: Box<dyn KexAlgorithm + Send>,
}

/// Run the exchange up to signature verification.
///
/// `server_kexinit` carries the server's KEXINIT when the peer initiated
/// the rekey; otherwise it is read from the wire. Packets that belong to
/// other state machines (possible during rekey) go through `passthrough`.
pub(crate) async fn exchange<S, F>(
    transport: &mut Transport<S>,
    preferred: &Preferred,
    client_id: &[u8],
    server_id: &[u8],
    cause: &KexCause,
    server_kexinit: Option<Packet>,
    mut passthrough: F,
) -> Result<PendingKex, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(Packet) -> Result<(), Error>,
{
    let mut exchange = Exchange::new(client_id, server_id);

    exchange.client_kex_init = write_kex(preferred)?;
    transport.send_payload(&exchange.client_kex_init).await?;

    let server_kexinit = match server_kexinit {
        Some(packet) => packet,
        None => loop {
            let packet = transport.read_significant().await?;
            if packet.msg_id() == Some(msg::KEXINIT) {
                break packet;
            }
            passthrough(packet)?;
        },
    };
    exchange.server_kex_init.extend(&server_kexinit);
    let mut names = read_kex(&server_kexinit, preferred)?;
    drop(server_kexinit);

    let mut kex = KEXES.get(&names.kex).ok_or(Error::UnknownAlgo)?.make();

    let mut init = SecureVec::new();
    kex.client_dh(&mut exchange.client_ephemeral, &mut init)?;
    transport.send_payload(&init).await?;

    let reply = loop {
        let packet = transport.read_significant().await?;
        match packet.msg_id() {
            Some(msg::KEX_ECDH_REPLY) if names.ignore_guessed => {
                // The server guessed wrong; its first KEX packet is void.
                debug!("ignoring guessed kex packet");
                names.ignore_guessed = false;
            }
            Some(msg::KEX_ECDH_REPLY) => break packet,
            Some(m) if msg::is_kex_msg(m) => {
                error!("unexpected kex message at this stage: {m:?}");
                return Err(Error::Kex);
            }
            _ => passthrough(packet)?,
        }
    };

    let r = &mut reply.payload().get(1..).ok_or(Error::MalformedPacket)?;
    let server_host_key_blob = Vec::<u8>::decode(r).map_err(malformed)?;
    let server_ephemeral = Vec::<u8>::decode(r).map_err(malformed)?;
    let signature_blob = Vec::<u8>::decode(r).map_err(malformed)?;
    drop(reply);

    let server_host_key = PublicKey::from(
        ssh_key::public::KeyData::decode(&mut &server_host_key_blob[..]).map_err(malformed)?,
    );
    debug!("received server host key: {}", server_host_key.algorithm());
    // RSA blobs always say ssh-rsa; the negotiated name carries the hash.
    let compatible = match (&server_host_key.algorithm(), &names.host_key) {
        (ssh_key::Algorithm::Rsa { .. }, ssh_key::Algorithm::Rsa { .. }) => true,
        (a, b) => a == b,
    };
    if !compatible {
        error!(
            "server sent a {} key, negotiated {}",
            server_host_key.algorithm(),
            names.host_key
        );
        return Err(Error::Kex);
    }

    exchange.server_ephemeral.extend(&server_ephemeral);
    kex.compute_shared_secret(&exchange.server_ephemeral)?;

    let exchange_hash = kex.compute_exchange_hash(&server_host_key_blob, &exchange)?;

    let signature = Signature::decode(&mut &signature_blob[..]).map_err(malformed)?;
    if let Err(e) = Verifier::verify(&server_host_key, &exchange_hash, &signature) {
        debug!("wrong server signature: {e:?}");
        return Err(Error::WrongServerSig);
    }

    let session_id = match cause.session_id() {
        Some(id) => id.clone(),
        None => exchange_hash.clone(),
    };

    Ok(PendingKex {
        names,
        server_host_key,
        exchange_hash,
        session_id,
        kex,
    })
}

impl PendingKex {
    /// Send NEWKEYS, wait for the peer's, and switch both directions to
    /// the freshly derived keys. Each switch is atomic at a packet
    /// boundary; sequence numbers are not reset. The replaced codecs zero
    /// their key material on drop.
    pub async fn finish<S, F>(
        self,
        transport: &mut Transport<S>,
        mut passthrough: F,
    ) -> Result<(Names, SecureVec, PublicKey), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        F: FnMut(Packet) -> Result<(), Error>,
    {
        let pair = self
            .kex
            .compute_keys(&self.session_id, &self.exchange_hash, &self.names, false)?;

        transport.send_payload(&[msg::NEWKEYS]).await?;
        transport.outbound.set_sealing_key(pair.local_to_remote);

        loop {
            let packet = transport.read_significant().await?;
            match packet.msg_id() {
                Some(msg::NEWKEYS) => break,
                Some(m) if msg::is_kex_msg(m) => {
                    error!("unexpected kex message at this stage: {m:?}");
                    return Err(Error::Kex);
                }
                _ => passthrough(packet)?,
            }
        }
        transport.inbound.set_opening_key(pair.remote_to_local);
        transport.reset_rekey_counters();

        Ok((self.names, self.session_id, self.server_host_key))
    }
}
