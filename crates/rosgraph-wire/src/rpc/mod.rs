//! The RPC channel the registry and node endpoints are reached through.
//!
//! One request gets one response on the same connection; clients open a new
//! connection per call.

pub mod client;
pub mod master_client;
pub mod message;
pub mod server;
pub mod slave_client;

pub use client::RpcClient;
pub use master_client::MasterClient;
pub use message::{RpcMessage, RpcMessageKind, RpcRequest, RpcResponse};
pub use server::{RpcHandler, RpcServer};
pub use slave_client::SlaveClient;

use message::{decode_message, encode_message, MAX_RPC_MESSAGE_SIZE};
use rosgraph_types::{RosError, RosResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write a framed message (4-byte length + JSON).
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &RpcMessage,
) -> RosResult<()> {
    let bytes = encode_message(message)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message (4-byte length + JSON).
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> RosResult<RpcMessage> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(RosError::ConnectionClosed);
        }
        Err(e) => return Err(RosError::Io(e)),
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_RPC_MESSAGE_SIZE {
        return Err(RosError::FrameTooLarge {
            size: len,
            max: MAX_RPC_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    decode_message(&body)
}
