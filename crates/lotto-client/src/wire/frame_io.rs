// Low-level frame IO for lotto-wire over byte streams.
use bytes::{Bytes, BytesMut};
use lotto_wire::{FrameHeader, Reply, ReplyKind, Request};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Writes one length-prefixed frame. `write_all` keeps retrying short writes
/// until the payload is flushed to the stream or the stream fails.
pub async fn write_frame<W>(send: &mut W, payload: &[u8], max_frame_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    lotto_wire::check_payload_len(payload.len(), max_frame_bytes)?;
    let mut header_bytes = [0u8; FrameHeader::LEN];
    FrameHeader::new(payload.len() as u32).encode_into(&mut header_bytes);
    send.write_all(&header_bytes)
        .await
        .map_err(Error::connection("write frame header"))?;
    send.write_all(payload)
        .await
        .map_err(Error::connection("write frame payload"))?;
    Ok(())
}

/// Reads one length-prefixed frame and returns its payload.
pub async fn read_frame<R>(recv: &mut R, max_frame_bytes: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    let mut filled = 0;
    while filled < FrameHeader::LEN {
        let read = recv
            .read(&mut header_bytes[filled..])
            .await
            .map_err(Error::connection("read frame header"))?;
        if read == 0 {
            // A close before any byte is a dropped connection; a torn header
            // means the peer speaks something else.
            if filled == 0 {
                return Err(Error::connection("read frame header")(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before a reply",
                )));
            }
            return Err(Error::Protocol(format!(
                "stream closed mid-header after {filled} bytes"
            )));
        }
        filled += read;
    }

    // Bound the allocation before touching the body.
    let header = FrameHeader::decode(&header_bytes, max_frame_bytes)?;

    let mut payload = BytesMut::zeroed(header.length as usize);
    recv.read_exact(&mut payload[..])
        .await
        .map_err(Error::connection("read frame payload"))?;
    Ok(payload.freeze())
}

pub async fn write_request<W>(
    send: &mut W,
    request: &Request,
    max_frame_bytes: usize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = request.encode()?;
    write_frame(send, &payload, max_frame_bytes).await
}

pub async fn read_reply<R>(
    recv: &mut R,
    expected: ReplyKind,
    max_frame_bytes: usize,
) -> Result<Reply>
where
    R: AsyncRead + Unpin,
{
    let payload = read_frame(recv, max_frame_bytes).await?;
    Ok(Reply::decode_expecting(&payload, expected)?)
}
