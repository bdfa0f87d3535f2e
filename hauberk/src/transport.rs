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
//! The byte-level packet channel: one socket, one decoder and one encoder
//! per direction, and the per-direction sequence counters. Codecs are
//! replaced at NEWKEYS; the old instances are dropped (and zero their key
//! material) at the switch.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cipher::{self, Cipher, OpeningKey, SealingKey};
use crate::sshbuf::{BufPool, Packet, SegmentPool, Sequence, StreamCounters};
use crate::{msg, Error, Limits, SecureVec};

/// The receiving half: staging buffer, decoder, inbound counters.
pub(crate) struct Inbound<R> {
    stream: R,
    staging: Sequence,
    pub counters: StreamCounters,
    opening: Box<dyn OpeningKey + Send>,
    pool: Arc<BufPool>,
    max_packet_len: usize,
}

/// The sending half: encoder and outbound counters. Writes are serialized
/// by ownership; packets leave in call order.
pub(crate) struct Outbound<W> {
    stream: W,
    pub counters: StreamCounters,
    sealing: Box<dyn SealingKey + Send>,
    buf: SecureVec,
}

pub(crate) struct Transport<S: AsyncRead + AsyncWrite> {
    pub inbound: Inbound<io::ReadHalf<S>>,
    pub outbound: Outbound<io::WriteHalf<S>>,
    pub last_kex: Instant,
}

impl<R: AsyncRead + Unpin> Inbound<R> {
    /// Decode the next frame, reading from the socket as needed. A clean
    /// EOF (or any EOF mid-frame) is [`Error::ConnectionClosed`].
    pub async fn read_packet(&mut self) -> Result<Packet, Error> {
        loop {
            if let Some(packet) = cipher::try_decode(
                &mut self.staging,
                &mut self.counters,
                &mut *self.opening,
                self.max_packet_len,
                &self.pool,
            )? {
                trace!("read packet, seqn now {}", self.counters.seqn.0);
                return Ok(packet);
            }
            let span = self.staging.spare_mut();
            let n = self.stream.read(span).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.staging.commit(n);
        }
    }

    /// Like [`Inbound::read_packet`], but consumes IGNORE/DEBUG/EXT_INFO
    /// chatter and turns DISCONNECT into connection teardown.
    pub async fn read_significant(&mut self) -> Result<Packet, Error> {
        loop {
            let packet = self.read_packet().await?;
            match packet.msg_id() {
                Some(msg::DISCONNECT) => {
                    debug!("received DISCONNECT");
                    return Err(Error::ConnectionClosed);
                }
                Some(m) if msg::is_transparent_msg(m) => {
                    trace!("dropping transparent message {m}");
                }
                Some(_) => return Ok(packet),
                None => return Err(Error::MalformedPacket),
            }
        }
    }

    pub fn set_opening_key(&mut self, key: Box<dyn OpeningKey + Send>) {
        self.opening = key;
    }

    pub fn reset_rekey_counters(&mut self) {
        self.counters.bytes = 0;
        self.counters.packets = 0;
    }
}

impl<W: AsyncWrite + Unpin> Outbound<W> {
    /// Seal and send one payload. Ordered by ownership of the half.
    pub async fn send_payload(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.buf.clear();
        self.sealing
            .write(payload, &mut self.counters, &mut self.buf);
        self.stream.write_all(&self.buf).await?;
        self.stream.flush().await?;
        self.buf.clear();
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    pub fn set_sealing_key(&mut self, key: Box<dyn SealingKey + Send>) {
        self.sealing = key;
    }

    pub fn reset_rekey_counters(&mut self) {
        self.counters.bytes = 0;
        self.counters.packets = 0;
    }
}

impl<S: AsyncRead + AsyncWrite> Transport<S> {
    pub fn new(stream: S, max_packet_len: usize) -> Self {
        let (r, w) = io::split(stream);
        let segments = SegmentPool::new();
        Transport {
            inbound: Inbound {
                stream: r,
                staging: Sequence::new(segments),
                counters: StreamCounters::default(),
                opening: cipher::_CLEAR.make_opening_key(&[], &[], &[], &crate::mac::_NONE),
                pool: BufPool::new(),
                max_packet_len,
            },
            outbound: Outbound {
                stream: w,
                counters: StreamCounters::default(),
                sealing: cipher::_CLEAR.make_sealing_key(&[], &[], &[], &crate::mac::_NONE),
                buf: SecureVec::new(),
            },
            last_kex: Instant::now(),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    pub async fn read_packet(&mut self) -> Result<Packet, Error> {
        self.inbound.read_packet().await
    }

    pub async fn read_significant(&mut self) -> Result<Packet, Error> {
        self.inbound.read_significant().await
    }

    pub async fn send_payload(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.outbound.send_payload(payload).await
    }

    /// Whether any rekey threshold has been crossed: bytes per direction,
    /// the sequence space, or elapsed time - whichever comes first.
    pub fn needs_rekey(&self, limits: &Limits) -> bool {
        self.inbound.counters.bytes >= limits.rekey_read_limit
            || self.outbound.counters.bytes >= limits.rekey_write_limit
            || self.inbound.counters.packets >= u32::MAX as u64
            || self.outbound.counters.packets >= u32::MAX as u64
            || self.last_kex.elapsed() >= limits.rekey_time_limit
    }

    pub fn reset_rekey_counters(&mut self) {
        self.inbound.reset_rekey_counters();
        self.outbound.reset_rekey_counters();
        self.last_kex = Instant::now();
    }
}
