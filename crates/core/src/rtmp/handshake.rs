//! Simple (non-digest) RTMP handshake.
//!
//! ```text
//! Client                                Server
//!   |--- C0 (version 3) + C1 (1536) ----->|
//!   |<-- S0 + S1 (1536) + S2 (echo C1) ---|
//!   |--- C2 (echo S1) ------------------->|
//! ```
//!
//! C1 and S1 are a 4-byte epoch, 4 zero bytes, then 1528 bytes filled by
//! repeating a watermark string.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ProtocolErrorKind, Result};

pub const RTMP_VERSION: u8 = 3;
pub const HANDSHAKE_SIZE: usize = 1536;
const RANDOM_OFFSET: usize = 8;

/// C1/S1 block: epoch, zeros, watermark-filled opaque part.
pub fn make_c1s1(watermark: &str) -> [u8; HANDSHAKE_SIZE] {
    let mut block = [0u8; HANDSHAKE_SIZE];
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default();
    block[..4].copy_from_slice(&epoch.to_be_bytes());
    let mark = if watermark.is_empty() { "rtmp" } else { watermark }.as_bytes();
    for (dst, src) in block[RANDOM_OFFSET..].iter_mut().zip(mark.iter().cycle()) {
        *dst = *src;
    }
    block
}

/// Whether S2 echoes the opaque part of our C1 byte for byte.
pub fn check_s2(c1: &[u8], s2: &[u8]) -> bool {
    c1.len() == HANDSHAKE_SIZE && s2.len() == HANDSHAKE_SIZE && c1[RANDOM_OFFSET..] == s2[RANDOM_OFFSET..]
}

pub async fn client_handshake<S>(stream: &mut S, watermark: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let c1 = make_c1s1(watermark);
    let mut c0c1 = Vec::with_capacity(1 + HANDSHAKE_SIZE);
    c0c1.push(RTMP_VERSION);
    c0c1.extend_from_slice(&c1);
    stream.write_all(&c0c1).await?;

    let mut s0s1s2 = vec![0u8; 1 + 2 * HANDSHAKE_SIZE];
    stream.read_exact(&mut s0s1s2).await?;
    if s0s1s2[0] != RTMP_VERSION {
        return Err(Error::invalid(ProtocolErrorKind::Handshake("unsupported version")));
    }
    let s1 = &s0s1s2[1..1 + HANDSHAKE_SIZE];
    let s2 = &s0s1s2[1 + HANDSHAKE_SIZE..];
    if !check_s2(&c1, s2) {
        return Err(Error::invalid(ProtocolErrorKind::Handshake("s2 does not echo c1")));
    }
    stream.write_all(s1).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn server_handshake<S>(stream: &mut S, watermark: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
    stream.read_exact(&mut c0c1).await?;
    if c0c1[0] != RTMP_VERSION {
        return Err(Error::invalid(ProtocolErrorKind::Handshake("unsupported version")));
    }

    let s1 = make_c1s1(watermark);
    let mut reply = Vec::with_capacity(1 + 2 * HANDSHAKE_SIZE);
    reply.push(RTMP_VERSION);
    reply.extend_from_slice(&s1);
    reply.extend_from_slice(&c0c1[1..]);
    stream.write_all(&reply).await?;
    stream.flush().await?;

    // Some clients do not echo S1 faithfully; C2 is read and discarded.
    let mut c2 = vec![0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut c2).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c1_carries_watermark() {
        let c1 = make_c1s1("streamcore");
        assert_eq!(&c1[4..8], &[0, 0, 0, 0]);
        assert_eq!(&c1[8..18], b"streamcore");
        assert_eq!(&c1[18..28], b"streamcore");
    }

    #[test]
    fn s2_must_echo_c1() {
        let c1 = make_c1s1("a");
        let mut s2 = c1;
        s2[..4].copy_from_slice(&[9, 9, 9, 9]);
        assert!(check_s2(&c1, &s2));
        s2[100] ^= 0xFF;
        assert!(!check_s2(&c1, &s2));
    }

    #[tokio::test]
    async fn client_and_server_agree() {
        let (mut a, mut b) = tokio::io::duplex(8192);
        let server = tokio::spawn(async move { server_handshake(&mut b, "srv").await });
        client_handshake(&mut a, "cli").await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn client_rejects_bad_version() {
        let (mut a, mut b) = tokio::io::duplex(8192);
        tokio::spawn(async move {
            let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
            b.read_exact(&mut c0c1).await.unwrap();
            let mut reply = vec![6u8];
            reply.extend(std::iter::repeat_n(0, 2 * HANDSHAKE_SIZE));
            b.write_all(&reply).await.unwrap();
            let mut rest = vec![0u8; HANDSHAKE_SIZE];
            let _ = b.read_exact(&mut rest).await;
        });
        assert!(client_handshake(&mut a, "cli").await.is_err());
    }
}
