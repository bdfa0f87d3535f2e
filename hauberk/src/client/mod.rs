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
//! # Connecting to servers
//!
//! [`connect`] drives the whole client handshake: TCP connect, version
//! exchange, key exchange gated on host-key verification, then
//! authentication with the configured [`Credential`]s in order. It
//! resolves to a [`Handle`] carrying packet IO for a channel layer built
//! on top.
//!
//! Host-key trust is decided against the known-hosts store first; only a
//! non-trusted classification consults the configured
//! [`HostAuthentication`] callback, which may accept the key once, record
//! it permanently, or reject it.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use ssh_key::{HashAlg, PublicKey};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{
    channel, unbounded_channel, Receiver, Sender, UnboundedReceiver, UnboundedSender,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::Credential;
use crate::known_hosts::{self, HostKeyDecision, KnownHostStatus};
use crate::sshbuf::Packet;
use crate::transport::Transport;
use crate::version::{read_remote_id, VersionId};
use crate::{msg, ConnectError, Disconnect, Error, Limits, Names, Preferred, SecureVec};

mod auth;
mod kex;

pub(crate) use kex::KexCause;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// `[user@]host[:port]`, port 22 and the process user by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Destination {
            user: user.into(),
            host: host.into(),
            port,
        }
    }
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (user, rest) = match s.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (user.to_string(), rest),
            Some(_) => return Err(Error::InvalidDestination),
            None => (whoami::username(), s),
        };
        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            // [v6-address]:port
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or(Error::InvalidDestination)?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| Error::InvalidDestination)?,
                None if tail.is_empty() => 22,
                None => return Err(Error::InvalidDestination),
            };
            (host.to_string(), port)
        } else {
            match rest.split_once(':') {
                Some((host, port)) if !port.contains(':') => (
                    host.to_string(),
                    port.parse().map_err(|_| Error::InvalidDestination)?,
                ),
                // More than one colon and no brackets: a bare v6 address.
                Some(_) => (rest.to_string(), 22),
                None => (rest.to_string(), 22),
            }
        };
        if host.is_empty() {
            return Err(Error::InvalidDestination);
        }
        Ok(Destination { user, host, port })
    }
}

/// The server's public host key with the fingerprints shown to users.
#[derive(Debug, Clone)]
pub struct ServerPublicKey {
    pub key: PublicKey,
    /// `SHA256:...`, the OpenSSH default presentation.
    pub sha256_fingerprint: String,
    /// Colon-separated MD5 hex, the legacy presentation.
    pub md5_fingerprint: String,
}

impl ServerPublicKey {
    fn new(key: PublicKey) -> Result<Self, Error> {
        let sha256_fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        let digest = md5::compute(key.to_bytes()?);
        let md5_fingerprint = digest
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":");
        Ok(ServerPublicKey {
            key,
            sha256_fingerprint,
            md5_fingerprint,
        })
    }
}

/// Everything observable about an established (or establishing)
/// connection; handed to the host-authentication callback and readable
/// from the [`Handle`].
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    /// The server's identification string.
    pub server_id: String,
    /// The negotiated algorithms.
    pub algorithms: Names,
    /// The exchange hash of the first key exchange.
    pub session_id: Vec<u8>,
    pub server_key: ServerPublicKey,
}

/// Decides whether to proceed with a server key the known-hosts store did
/// not vouch for. Invoked only for non-`Trusted` classifications.
#[async_trait]
pub trait HostAuthentication: Send + Sync {
    async fn authenticate(
        &self,
        status: KnownHostStatus,
        info: &ConnectionInfo,
        cancel: &CancellationToken,
    ) -> Result<HostKeyDecision, BoxError>;
}

/// The default verifier: nothing but the trust store is trusted.
pub struct StrictHostAuthentication;

#[async_trait]
impl HostAuthentication for StrictHostAuthentication {
    async fn authenticate(
        &self,
        status: KnownHostStatus,
        info: &ConnectionInfo,
        _cancel: &CancellationToken,
    ) -> Result<HostKeyDecision, BoxError> {
        warn!(
            "rejecting {} key {} for {}:{} ({status:?})",
            info.server_key.key.algorithm(),
            info.server_key.sha256_fingerprint,
            info.host,
            info.port,
        );
        Ok(match status {
            KnownHostStatus::Changed => HostKeyDecision::Changed,
            KnownHostStatus::Revoked => HostKeyDecision::Revoked,
            _ => HostKeyDecision::Unknown,
        })
    }
}

/// Connection settings. Immutable once [`connect`] starts.
pub struct Config {
    pub destination: Destination,
    /// Absolute deadline for the whole of connect, TCP included. `None`
    /// waits forever.
    pub connect_timeout: Option<Duration>,
    /// The user known-hosts file. `None` (or an empty path) disables the
    /// store; unknown hosts then depend entirely on `host_auth`.
    pub known_hosts_path: Option<PathBuf>,
    /// Also consult `/etc/ssh/ssh_known_hosts`.
    pub check_global_known_hosts: bool,
    /// Tried in order; empty is an error at connect start.
    pub credentials: Vec<Credential>,
    pub host_auth: Arc<dyn HostAuthentication>,
    pub preferred: Preferred,
    pub limits: Limits,
    pub max_packet_len: usize,
    pub client_id: VersionId,
}

impl Config {
    pub fn new(destination: Destination) -> Self {
        Config {
            destination,
            connect_timeout: None,
            known_hosts_path: known_hosts::user_known_hosts_path(),
            check_global_known_hosts: false,
            credentials: Vec::new(),
            host_auth: Arc::new(StrictHostAuthentication),
            preferred: Preferred::default(),
            limits: Limits::default(),
            max_packet_len: crate::cipher::DEFAULT_MAX_PACKET_LEN,
            client_id: VersionId::default(),
        }
    }

    fn known_hosts_path(&self) -> Option<&Path> {
        self.known_hosts_path
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }
}

/// A ready connection. Byte-oriented packet IO for the channel layer:
/// payloads in, decoded packets out, strictly FIFO per direction.
#[derive(Debug)]
pub struct Handle {
    info: ConnectionInfo,
    outbound: Sender<Vec<u8>>,
    inbound: UnboundedReceiver<Packet>,
    join: tokio::task::JoinHandle<Result<(), Error>>,
}

impl Handle {
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Queue one payload for sending. Packets leave in call order.
    pub async fn send_packet(&self, payload: &[u8]) -> Result<(), Error> {
        self.outbound
            .send(payload.to_vec())
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// The next inbound packet. Transport teardown surfaces as
    /// [`Error::ConnectionClosed`].
    pub async fn recv_packet(&mut self) -> Result<Packet, Error> {
        self.inbound.recv().await.ok_or(Error::ConnectionClosed)
    }

    /// Orderly teardown: sends SSH_MSG_DISCONNECT and closes the socket.
    pub async fn disconnect(self) {
        drop(self.outbound);
        let _ = self.join.await;
    }
}

/// Open a TCP connection to the configured destination and establish an
/// authenticated SSH session over it.
pub async fn connect(config: Arc<Config>, cancel: CancellationToken) -> Result<Handle, ConnectError> {
    if config.credentials.is_empty() {
        return Err(ConnectError::Failed(Error::NoCredentials));
    }
    if cancel.is_cancelled() {
        return Err(ConnectError::Cancelled);
    }

    let deadline = config.connect_timeout.map(|t| Instant::now() + t);
    let establishing = async {
        let addr = (config.destination.host.as_str(), config.destination.port);
        let stream = TcpStream::connect(addr).await.map_err(Error::from)?;
        handshake(&config, stream, &cancel).await
    };
    // Cancellation closes the socket by dropping the future mid-await;
    // explicit checks cover the non-suspending paths.
    let guarded = async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = establishing => r,
        }
    };
    let result = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, guarded).await {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout),
        },
        None => guarded.await,
    };
    result.map_err(ConnectError::from)
}

/// Like [`connect`], over an already-established stream. The destination
/// in `config` still names the host for known-hosts purposes.
pub async fn connect_stream<S>(
    config: Arc<Config>,
    stream: S,
    cancel: CancellationToken,
) -> Result<Handle, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if config.credentials.is_empty() {
        return Err(ConnectError::Failed(Error::NoCredentials));
    }
    if cancel.is_cancelled() {
        return Err(ConnectError::Cancelled);
    }
    let deadline = config.connect_timeout.map(|t| Instant::now() + t);
    let guarded = async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = handshake(&config, stream, &cancel) => r,
        }
    };
    let result = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, guarded).await {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout),
        },
        None => guarded.await,
    };
    result.map_err(ConnectError::from)
}

async fn handshake<S>(
    config: &Arc<Config>,
    mut stream: S,
    cancel: &CancellationToken,
) -> Result<Handle, Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Identification exchange.
    config.client_id.write(&mut stream).await?;
    let server_id = read_remote_id(&mut stream).await?;
    debug!("server id: {:?}", String::from_utf8_lossy(&server_id));

    let mut transport = Transport::new(stream, config.max_packet_len);
    let client_id = config.client_id.as_kex_hash_bytes().to_vec();

    // Initial key exchange; nothing else is in flight yet, so any
    // non-KEX packet is a protocol violation.
    let pending = kex::exchange(
        &mut transport,
        &config.preferred,
        &client_id,
        &server_id,
        &KexCause::Initial,
        None,
        |_| Err(Error::Protocol),
    )
    .await?;

    let info = ConnectionInfo {
        host: config.destination.host.clone(),
        port: config.destination.port,
        server_id: String::from_utf8_lossy(&server_id).into_owned(),
        algorithms: pending.names.clone(),
        session_id: pending.session_id.to_vec(),
        server_key: ServerPublicKey::new(pending.server_host_key.clone())?,
    };

    verify_host_key(config, &info, cancel).await?;

    let (names, session_id, server_host_key) =
        pending.finish(&mut transport, |_| Err(Error::Protocol)).await?;
    debug!("keys established ({:?})", names.cipher_s2c);

    auth::authenticate(
        &mut transport,
        &config.destination.user,
        &config.credentials,
        &session_id,
    )
    .await?;
    info!(
        "authenticated to {}:{} as {}",
        info.host, info.port, config.destination.user
    );

    // Ready: hand the transport to its own task.
    let (outbound_tx, outbound_rx) = channel(64);
    let (inbound_tx, inbound_rx) = unbounded_channel();
    let connection = Connection {
        transport,
        config: config.clone(),
        client_id,
        server_id,
        session_id,
        server_host_key,
        inbound: inbound_tx,
        outbound: outbound_rx,
    };
    let join = tokio::spawn(connection.run());

    Ok(Handle {
        info,
        outbound: outbound_tx,
        inbound: inbound_rx,
        join,
    })
}

/// Classify the server key against the trust store and, for anything but
/// `Trusted`, let the callback decide. `AddKnownHost` appends to the user
/// file (a no-op without one) and proceeds.
async fn verify_host_key(
    config: &Config,
    info: &ConnectionInfo,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let path = config.known_hosts_path();
    let status = known_hosts::classify(
        &info.host,
        info.port,
        &info.server_key.key,
        path,
        config.check_global_known_hosts,
    );
    debug!("known-hosts classification: {status:?}");
    if status == KnownHostStatus::Trusted {
        return Ok(());
    }

    let decision = config.host_auth.authenticate(status, info, cancel).await;
    // A callback that cancelled mid-decision wins over whatever it
    // returned or raised, and nothing may be written afterwards.
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let decision = decision.map_err(|e| Error::HostKeyVerification { source: Some(e) })?;

    match decision {
        HostKeyDecision::Trusted => Ok(()),
        HostKeyDecision::AddKnownHost => {
            if let Some(path) = path {
                known_hosts::learn(path, &info.host, info.port, &info.server_key.key)?;
            }
            Ok(())
        }
        rejection => {
            info!("host key rejected by callback: {rejection:?}");
            Err(Error::HostKeyVerification { source: None })
        }
    }
}

/// The post-Ready transport task: forwards inbound packets, serializes
/// outbound payloads, and re-keys when a threshold trips or the server
/// asks.
struct Connection<S: AsyncRead + AsyncWrite> {
    transport: Transport<S>,
    config: Arc<Config>,
    client_id: Vec<u8>,
    server_id: Vec<u8>,
    session_id: SecureVec,
    server_host_key: PublicKey,
    inbound: UnboundedSender<Packet>,
    outbound: Receiver<Vec<u8>>,
}

enum Event {
    Inbound(Result<Packet, Error>),
    Outbound(Option<Vec<u8>>),
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    async fn run(mut self) -> Result<(), Error> {
        let result = self.serve().await;
        if let Err(ref e) = result {
            debug!("transport loop ending: {e}");
        }
        self.transport.outbound.shutdown().await;
        result
    }

    async fn serve(&mut self) -> Result<(), Error> {
        loop {
            if self.transport.needs_rekey(&self.config.limits) {
                info!("re-exchanging keys");
                self.rekey(None).await?;
            }

            let event = tokio::select! {
                r = self.transport.inbound.read_packet() => Event::Inbound(r),
                o = self.outbound.recv() => Event::Outbound(o),
            };

            match event {
                Event::Inbound(packet) => {
                    let packet = packet?;
                    match packet.msg_id() {
                        Some(msg::DISCONNECT) => {
                            debug!("received DISCONNECT");
                            return Ok(());
                        }
                        Some(m) if msg::is_transparent_msg(m) => {}
                        Some(msg::KEXINIT) => self.rekey(Some(packet)).await?,
                        Some(m) if msg::is_kex_msg(m) => return Err(Error::Protocol),
                        Some(_) => {
                            if self.inbound.send(packet).is_err() {
                                // Receiver gone: the Handle was dropped.
                                return self.send_disconnect().await;
                            }
                        }
                        None => return Err(Error::MalformedPacket),
                    }
                }
                Event::Outbound(Some(payload)) => {
                    self.transport.send_payload(&payload).await?;
                }
                Event::Outbound(None) => {
                    return self.send_disconnect().await;
                }
            }
        }
    }

    async fn send_disconnect(&mut self) -> Result<(), Error> {
        let mut payload = SecureVec::new();
        payload.push(msg::DISCONNECT);
        use ssh_encoding::Encode;
        (Disconnect::ByApplication as u32).encode(&mut payload)?;
        "disconnected by application".encode(&mut payload)?;
        "".encode(&mut payload)?;
        self.transport.send_payload(&payload).await?;
        Ok(())
    }

    /// Re-run the key exchange on the live connection. Inbound non-KEX
    /// traffic keeps flowing to the channel layer; outbound user traffic
    /// waits in the queue until NEWKEYS.
    async fn rekey(&mut self, server_kexinit: Option<Packet>) -> Result<(), Error> {
        let inbound = self.inbound.clone();
        let passthrough = |p: Packet| {
            inbound.send(p).map_err(|_| Error::SendError)?;
            Ok(())
        };

        let cause = KexCause::Rekey {
            session_id: self.session_id.clone(),
        };
        let pending = kex::exchange(
            &mut self.transport,
            &self.config.preferred,
            &self.client_id,
            &self.server_id,
            &cause,
            server_kexinit,
            passthrough,
        )
        .await?;

        // The host key is pinned at the first exchange.
        if pending.server_host_key.key_data() != self.server_host_key.key_data() {
            warn!("server host key changed across rekey");
            return Err(Error::HostKeyVerification { source: None });
        }

        let inbound = self.inbound.clone();
        let passthrough = |p: Packet| {
            inbound.send(p).map_err(|_| Error::SendError)?;
            Ok(())
        };
        pending.finish(&mut self.transport, passthrough).await?;
        Ok(())
    }
}
