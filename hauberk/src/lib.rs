#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match, clippy::upper_case_acronyms)]
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

//! Client-side SSH transport and user authentication, based on tokio.
//!
//! This crate implements the lower half of an SSH client: the framed,
//! sequence-numbered, encrypted packet channel that sits between a TCP
//! socket and a higher-level channel multiplexer. It covers the version
//! exchange, algorithm negotiation, the key-exchange state machine with
//! session-key derivation, the packet codec family (including AEAD
//! constructions such as AES-GCM and the OpenSSH ChaCha20-Poly1305),
//! host-key verification against a known-hosts trust store, and the
//! user-authentication state machine.
//!
//! The entry point is [`client::connect`]: it resolves a destination,
//! performs the handshake, gates on host-key verification, authenticates
//! with the configured credentials in order, and hands back a
//! [`client::Handle`] carrying byte-oriented packet IO for a channel layer
//! built on top.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hauberk::client::{self, Config};
//! use hauberk::auth::Credential;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::new("alice@example.com:22".parse()?);
//!     config.credentials.push(Credential::Password("hunter2".into()));
//!     let handle = client::connect(Arc::new(config), CancellationToken::new()).await?;
//!     println!("connected to {}", handle.connection_info().host);
//!     Ok(())
//! }
//! ```
//!
//! There is no server role in this crate.

pub use securevec::SecureVec;
use thiserror::Error;

pub mod auth;
/// Cipher names and the packet codec family.
pub mod cipher;
/// Compression algorithm names.
pub mod compression;
/// Key exchange algorithm names.
pub mod kex;
pub mod known_hosts;
/// MAC algorithm names.
pub mod mac;

mod msg;
mod negotiation;
mod sshbuf;
mod transport;
mod version;
mod wire;

pub use negotiation::{Names, Preferred};
pub use sshbuf::Packet;
pub use version::VersionId;

/// Client side of this library.
pub mod client;

#[cfg(test)]
mod tests;

/// Which negotiation category failed to produce a common algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmKind {
    Kex,
    HostKey,
    Cipher,
    Mac,
    Compression,
}

/// Errors raised by the transport and the handshake state machines.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The remote identification string was missing or malformed.
    #[error("invalid SSH identification string")]
    Version,

    /// A destination string did not parse as `[user@]host[:port]`.
    #[error("invalid destination")]
    InvalidDestination,

    /// Banner, framing, or an unexpected message id.
    #[error("protocol error")]
    Protocol,

    /// A packet declared a length beyond the configured or hard maximum.
    #[error("packet too long ({0} bytes)")]
    PacketTooLong(usize),

    /// A packet length violated the cipher's block alignment.
    #[error("bad packet length")]
    BadLength,

    /// MAC or AEAD tag verification failed.
    #[error("packet integrity check failed")]
    IntegrityFailure,

    /// A packet or field could not be parsed.
    #[error("malformed packet")]
    MalformedPacket,

    /// No common algorithm was found during negotiation.
    #[error("no common {kind:?} algorithm - ours: {ours:?}, theirs: {theirs:?}")]
    NoCommonAlgorithm {
        kind: AlgorithmKind,
        ours: Vec<String>,
        theirs: Vec<String>,
    },

    /// An algorithm name survived negotiation but has no implementation.
    #[error("unknown algorithm")]
    UnknownAlgo,

    /// Key exchange failed.
    #[error("key exchange failed")]
    Kex,

    /// The server's signature over the exchange hash did not verify.
    #[error("wrong server host key signature")]
    WrongServerSig,

    /// The host key verifier declined the connection, or the user callback
    /// failed. The callback's error, if any, is attached verbatim.
    #[error("server host key rejected")]
    HostKeyVerification {
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Every configured credential was exhausted without success. Carries
    /// the last method list returned by the server.
    #[error("authentication failed (server accepts: {methods:?})")]
    AuthenticationFailed { methods: auth::MethodSet },

    /// The credential list was empty when connect started.
    #[error("no credentials configured")]
    NoCredentials,

    /// The connect deadline elapsed.
    #[error("connect timeout")]
    Timeout,

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// The connection was closed by the remote side.
    #[error("connection closed by the remote side")]
    ConnectionClosed,

    /// The transport task is gone.
    #[error("channel send error")]
    SendError,

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),

    #[error("SshKey: {0}")]
    SshKey(#[from] ssh_key::Error),

    #[error("SshEncoding: {0}")]
    SshEncoding(#[from] ssh_encoding::Error),

    #[error("Signature: {0}")]
    Signature(#[from] signature::Error),
}

/// The public failure type of [`client::connect`].
///
/// Every failure before the connection reaches `Ready` is wrapped exactly
/// once as [`ConnectError::Failed`] with the original error as its source.
/// Cancellation is surfaced as [`ConnectError::Cancelled`] and is never
/// wrapped.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect failed")]
    Failed(#[source] Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<Error> for ConnectError {
    fn from(e: Error) -> Self {
        match e {
            Error::Cancelled => ConnectError::Cancelled,
            e => ConnectError::Failed(e),
        }
    }
}

impl ConnectError {
    /// The inner cause, if this is a [`ConnectError::Failed`].
    pub fn cause(&self) -> Option<&Error> {
        match self {
            ConnectError::Failed(e) => Some(e),
            ConnectError::Cancelled => None,
        }
    }
}

/// The number of bytes read/written, and the time elapsed, before a key
/// re-exchange is requested.
#[derive(Debug, Clone)]
pub struct Limits {
    pub rekey_write_limit: u64,
    pub rekey_read_limit: u64,
    pub rekey_time_limit: std::time::Duration,
}

impl Limits {
    /// Create a new `Limits`, checking that the given bounds cannot lead to
    /// nonce reuse.
    pub fn new(write_limit: u64, read_limit: u64, time_limit: std::time::Duration) -> Limits {
        assert!(write_limit <= 1 << 30 && read_limit <= 1 << 30);
        Limits {
            rekey_write_limit: write_limit,
            rekey_read_limit: read_limit,
            rekey_time_limit: time_limit,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        // Following the recommendations of
        // https://tools.ietf.org/html/rfc4253#section-9
        Limits {
            rekey_write_limit: 1 << 30, // 1 GiB
            rekey_read_limit: 1 << 30,  // 1 GiB
            rekey_time_limit: std::time::Duration::from_secs(3600),
        }
    }
}

/// A reason for disconnection, RFC 4253 section 11.1.
#[allow(missing_docs)] // This should be relatively self-explanatory.
#[derive(Debug, Clone, Copy)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    Reserved = 4,
    MACError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}
