use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Error;

/// The identification string we announce,
/// https://tools.ietf.org/html/rfc4253#section-4.2.
#[derive(Debug, Clone)]
pub enum VersionId {
    /// When sending the id, append the RFC standard `\r\n`. Example:
    /// `VersionId::Standard("SSH-2.0-acme".to_string())`.
    Standard(String),
    /// Use this buffer as-is, no added line terminator.
    Raw(String),
}

impl Default for VersionId {
    fn default() -> Self {
        VersionId::Standard(format!("SSH-2.0-hauberk_{}", env!("CARGO_PKG_VERSION")))
    }
}

impl VersionId {
    /// The bytes that go into the exchange hash: the line without its
    /// terminator.
    pub(crate) fn as_kex_hash_bytes(&self) -> &[u8] {
        match self {
            Self::Standard(s) => s.as_bytes(),
            Self::Raw(s) => s.trim_end_matches(['\n', '\r']).as_bytes(),
        }
    }

    pub(crate) async fn write<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> Result<(), Error> {
        match self {
            Self::Standard(s) => {
                stream.write_all(format!("{s}\r\n").as_bytes()).await?;
            }
            Self::Raw(s) => {
                stream.write_all(s.as_bytes()).await?;
            }
        }
        stream.flush().await?;
        Ok(())
    }
}

/// A server may send any number of banner lines before its identification
/// string; each line is capped at 255 bytes and the whole preamble at
/// 64 KiB (https://tools.ietf.org/html/rfc4253#section-4.2).
const MAX_LINE_LEN: usize = 255;
const MAX_PREAMBLE: usize = 64 * 1024;

/// Read the remote identification string, tolerating preceding banner
/// lines. Returns the line without its terminator. Reads byte-at-a-time so
/// no packet bytes are consumed past the line break.
pub(crate) async fn read_remote_id<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, Error> {
    let mut total = 0usize;
    loop {
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            if stream.read_exact(&mut byte).await.is_err() {
                return Err(Error::Version);
            }
            total += 1;
            if total > MAX_PREAMBLE {
                return Err(Error::Version);
            }
            if byte[0] == b'\n' {
                break;
            }
            if line.len() >= MAX_LINE_LEN {
                return Err(Error::Version);
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.starts_with(b"SSH-") {
            if !line.starts_with(b"SSH-2.0-") && !line.starts_with(b"SSH-1.99-") {
                return Err(Error::Version);
            }
            return Ok(line);
        }
        debug!("skipping banner line: {:?}", String::from_utf8_lossy(&line));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_id_after_banner_lines() {
        let input = b"welcome to the machine\r\nno really\nSSH-2.0-OpenSSH_9.7\r\nleftover";
        let mut cursor = &input[..];
        let id = read_remote_id(&mut cursor).await.unwrap();
        assert_eq!(id, b"SSH-2.0-OpenSSH_9.7");
        // Nothing beyond the line terminator was consumed.
        assert_eq!(cursor, b"leftover");
    }

    #[tokio::test]
    async fn rejects_old_protocol_versions() {
        let mut cursor = &b"SSH-1.5-old\r\n"[..];
        assert!(matches!(
            read_remote_id(&mut cursor).await,
            Err(Error::Version)
        ));
    }

    #[tokio::test]
    async fn rejects_overlong_lines() {
        let mut input = vec![b'x'; 300];
        input.extend_from_slice(b"\r\nSSH-2.0-x\r\n");
        let mut cursor = &input[..];
        assert!(matches!(
            read_remote_id(&mut cursor).await,
            Err(Error::Version)
        ));
    }

    #[tokio::test]
    async fn rejects_oversized_preamble() {
        let mut input = Vec::new();
        for _ in 0..300 {
            input.extend_from_slice(&[b'y'; 250]);
            input.extend_from_slice(b"\r\n");
        }
        input.extend_from_slice(b"SSH-2.0-x\r\n");
        let mut cursor = &input[..];
        assert!(matches!(
            read_remote_id(&mut cursor).await,
            Err(Error::Version)
        ));
    }

    #[test]
    fn kex_hash_bytes_strip_terminators() {
        assert_eq!(
            VersionId::Standard("SSH-2.0-acme".into()).as_kex_hash_bytes(),
            b"SSH-2.0-acme"
        );
        assert_eq!(
            VersionId::Raw("SSH-2.0-raw\r\n".into()).as_kex_hash_bytes(),
            b"SSH-2.0-raw"
        );
    }
}
