//! Length-prefixed frames on an established connection.

use crate::header::ConnectionHeader;
use bytes::{BufMut, Bytes, BytesMut};
use rosgraph_types::{RosError, RosResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted frame or header size (64 MB).
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Prefix `payload` with its u32 LE length.
pub fn encode_frame(payload: &[u8]) -> RosResult<Bytes> {
    let len = frame_len(payload.len())?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32_le(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

fn frame_len(len: usize) -> RosResult<u32> {
    match u32::try_from(len) {
        Ok(n) if n <= MAX_FRAME_SIZE => Ok(n),
        _ => Err(RosError::FrameTooLarge {
            size: u32::try_from(len).unwrap_or(u32::MAX),
            max: MAX_FRAME_SIZE,
        }),
    }
}

async fn read_len<R: AsyncRead + Unpin>(reader: &mut R) -> RosResult<u32> {
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(RosError::ConnectionClosed);
        }
        Err(e) => return Err(RosError::Io(e)),
    }
    let len = u32::from_le_bytes(prefix);
    if len > MAX_FRAME_SIZE {
        return Err(RosError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(len)
}

async fn read_exact_bytes<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> RosResult<Bytes> {
    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(Bytes::from(body)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(RosError::ConnectionClosed),
        Err(e) => Err(RosError::Io(e)),
    }
}

/// Read one frame; a clean EOF before the prefix yields `ConnectionClosed`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> RosResult<Bytes> {
    let len = read_len(reader).await?;
    read_exact_bytes(reader, len as usize).await
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> RosResult<()> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> RosResult<ConnectionHeader> {
    let body = read_frame(reader).await?;
    ConnectionHeader::decode_body(&body)
}

pub async fn write_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &ConnectionHeader,
) -> RosResult<()> {
    let bytes = header.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a service reply: one ok byte, then a length-prefixed payload that is
/// the serialized response on success or UTF-8 error text on failure.
pub async fn write_service_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    outcome: Result<&[u8], &str>,
) -> RosResult<()> {
    let (ok, payload) = match outcome {
        Ok(bytes) => (1u8, bytes),
        Err(text) => (0u8, text.as_bytes()),
    };
    let len = frame_len(payload.len())?;
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(ok);
    buf.put_u32_le(len);
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a service reply written by [`write_service_response`].
pub async fn read_service_response<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> RosResult<Result<Bytes, String>> {
    let mut ok = [0u8; 1];
    match reader.read_exact(&mut ok).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(RosError::ConnectionClosed);
        }
        Err(e) => return Err(RosError::Io(e)),
    }
    let len = read_len(reader).await?;
    let payload = read_exact_bytes(reader, len as usize).await?;
    if ok[0] == 1 {
        Ok(Ok(payload))
    } else {
        Ok(Err(String::from_utf8_lossy(&payload).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap().as_ref(), b"hello");
        assert!(read_frame(&mut b).await.unwrap().is_empty());
        drop(a);
        assert!(matches!(
            read_frame(&mut b).await,
            Err(RosError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_rejects_oversized_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_SIZE + 1).to_le_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(RosError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_header_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let header = ConnectionHeader::new().with("callerid", "/x");
        write_header(&mut a, &header).await.unwrap();
        assert_eq!(read_header(&mut b).await.unwrap(), header);
    }

    #[tokio::test]
    async fn test_service_response_layout() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_service_response(&mut a, Ok(&[4, 0, 0, 0, 0, 0, 0, 0]))
            .await
            .unwrap();
        write_service_response(&mut a, Err("no such thing")).await.unwrap();
        assert_eq!(
            read_service_response(&mut b).await.unwrap(),
            Ok(Bytes::from_static(&[4, 0, 0, 0, 0, 0, 0, 0]))
        );
        assert_eq!(
            read_service_response(&mut b).await.unwrap(),
            Err("no such thing".to_string())
        );
    }
}
