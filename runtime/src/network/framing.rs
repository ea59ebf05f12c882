// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::{from_slice, to_vec};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{deal_error, DealError};

/// Largest message accepted on any stream.
pub const MAX_FRAME_SIZE: usize = 16 << 20;

/// Writes one message: an unsigned-varint length followed by its DAG-CBOR encoding.
pub async fn write_message<W, T>(w: &mut W, msg: &T) -> Result<(), DealError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = to_vec(msg)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(deal_error!(illegal_argument; "message of {} bytes exceeds frame limit", body.len()));
    }
    let mut len = unsigned_varint::encode::usize_buffer();
    w.write_all(unsigned_varint::encode::usize(body.len(), &mut len)).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one message written by [`write_message`].
pub async fn read_message<R, T>(r: &mut R) -> Result<T, DealError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = read_length(r).await?;
    if len > MAX_FRAME_SIZE {
        return Err(deal_error!(serialization; "frame of {} bytes exceeds limit", len));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(from_slice(&body)?)
}

async fn read_length<R: AsyncRead + Unpin>(r: &mut R) -> Result<usize, DealError> {
    let mut buf = [0u8; 10];
    for i in 0..buf.len() {
        buf[i] = r.read_u8().await?;
        if buf[i] & 0x80 == 0 {
            let (len, _) = unsigned_varint::decode::usize(&buf[..=i])
                .map_err(|e| deal_error!(serialization; "invalid frame length: {}", e))?;
            return Ok(len);
        }
    }
    Err(deal_error!(serialization; "frame length varint too long"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_carry_messages_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &(1u64, "first".to_string())).await.unwrap();
        write_message(&mut a, &vec![7u8; 300]).await.unwrap();

        let first: (u64, String) = read_message(&mut b).await.unwrap();
        assert_eq!(first, (1, "first".into()));
        let second: Vec<u8> = read_message(&mut b).await.unwrap();
        assert_eq!(second.len(), 300);

        drop(a);
        let err = read_message::<_, u64>(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Network);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut len = unsigned_varint::encode::usize_buffer();
        a.write_all(unsigned_varint::encode::usize(MAX_FRAME_SIZE + 1, &mut len)).await.unwrap();
        let err = read_message::<_, u64>(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Serialization);
    }
}
