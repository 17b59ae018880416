//! Stream helpers shared by the serving, fetching and directory sides.

use std::io;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use swarm_core::wire::{self, FrameDecodeError, FrameEncodeError, LEN_SIZE};
use swarm_core::CodecError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("frame encode error: {0}")]
    FrameEncode(#[from] FrameEncodeError),
    #[error("frame decode error: {0}")]
    FrameDecode(#[from] FrameDecodeError),
    #[error("connection closed mid-message")]
    UnexpectedEof,
    #[error("message exceeds {0} bytes")]
    TooLarge(usize),
    #[error("no data for {0:?}")]
    Idle(Duration),
}

/// Read from `reader` until `decode` accepts the buffered bytes. `decode` follows the
/// core codec convention of returning `CodecError::NeedMore` on a short buffer.
///
/// `idle` bounds each individual read, not the whole message: a peer that keeps
/// sending stays within it however long the transfer takes.
pub async fn read_message<R, T, F>(
    reader: &mut R,
    limit: usize,
    idle: Duration,
    decode: F,
) -> Result<T, StreamError>
where
    R: AsyncRead + Unpin,
    F: Fn(&[u8]) -> Result<(T, usize), CodecError>,
{
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match decode(&buf) {
            Ok((msg, _)) => return Ok(msg),
            Err(CodecError::NeedMore) => {}
            Err(e) => return Err(e.into()),
        }
        if buf.len() >= limit {
            return Err(StreamError::TooLarge(limit));
        }
        let want = READ_CHUNK.min(limit - buf.len());
        let n = timeout(idle, reader.read(&mut chunk[..want]))
            .await
            .map_err(|_| StreamError::Idle(idle))??;
        if n == 0 {
            return Err(StreamError::UnexpectedEof);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub async fn write_message<W>(writer: &mut W, bytes: &[u8]) -> Result<(), StreamError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed bincode frame. `Ok(None)` on a clean close between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, StreamError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; LEN_SIZE];
    match reader.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    reader
        .read_exact(&mut header[1..])
        .await
        .map_err(eof_mid_message)?;
    let len = wire::frame_len(header)?;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(eof_mid_message)?;
    Ok(Some(wire::decode_payload(&payload)?))
}

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), StreamError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = wire::encode_frame(msg)?;
    write_message(writer, &frame).await
}

fn eof_mid_message(e: io::Error) -> StreamError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        StreamError::UnexpectedEof
    } else {
        StreamError::Io(e)
    }
}
