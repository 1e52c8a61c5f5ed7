//! One-shot RPC calls.

use super::message::{RpcMessage, RpcMessageKind, RpcRequest, RpcResponse};
use super::{read_message, write_message};
use rosgraph_types::{RosError, RosResult};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Calls an RPC endpoint at a fixed address, one connection per call.
#[derive(Debug, Clone)]
pub struct RpcClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send `request` and wait for its response. The whole round trip is
    /// bounded by the client's timeout.
    pub async fn call(&self, request: RpcRequest) -> RosResult<RpcResponse> {
        let method = request.method();
        match tokio::time::timeout(self.timeout, self.round_trip(request)).await {
            Ok(result) => result,
            Err(_) => Err(RosError::Timeout {
                operation: format!("{method} on {}", self.addr),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    async fn round_trip(&self, request: RpcRequest) -> RosResult<RpcResponse> {
        let method = request.method();
        let message = RpcMessage::request(request);
        let mut stream = TcpStream::connect(self.addr).await?;
        write_message(&mut stream, &message).await?;
        let reply = read_message(&mut stream).await?;
        match reply.kind {
            RpcMessageKind::Response(response) if reply.id == message.id => {
                debug!(addr = %self.addr, method, code = response.code, "RPC response");
                Ok(response)
            }
            RpcMessageKind::Response(_) => Err(RosError::RegistryFault {
                code: super::message::CODE_ERROR,
                message: format!("response id {} does not match request {}", reply.id, message.id),
            }),
            RpcMessageKind::Request(_) => Err(RosError::RegistryFault {
                code: super::message::CODE_ERROR,
                message: "peer answered with a request".into(),
            }),
        }
    }
}
