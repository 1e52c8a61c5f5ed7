//! RPC endpoint: serves requests with an [`RpcHandler`].

use super::message::{RpcMessage, RpcMessageKind, RpcRequest, RpcResponse};
use super::{read_message, write_message};
use crate::server::{ConnectionHandler, TcpServer};
use async_trait::async_trait;
use rosgraph_types::{RosError, RosResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Answers RPC requests. Faults are reported through the response code,
/// never by failing the connection.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, request: RpcRequest) -> RpcResponse;
}

struct RpcConnections {
    handler: Arc<dyn RpcHandler>,
}

#[async_trait]
impl ConnectionHandler for RpcConnections {
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> RosResult<()> {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(()),
                message = read_message(&mut stream) => match message {
                    Ok(message) => message,
                    Err(RosError::ConnectionClosed) => return Ok(()),
                    Err(RosError::Json(e)) => {
                        warn!(peer = %peer, error = %e, "Undecodable RPC request");
                        let reply = RpcMessage::response("", RpcResponse::error(format!("invalid request: {e}")));
                        write_message(&mut stream, &reply).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            let response = match message.kind {
                RpcMessageKind::Request(request) => {
                    let method = request.method();
                    debug!(peer = %peer, method, caller = %request.caller_id(), "RPC request");
                    let response = self.handler.handle(request).await;
                    if !response.is_success() {
                        debug!(peer = %peer, method, code = response.code, status = %response.status_message, "RPC fault");
                    }
                    response
                }
                RpcMessageKind::Response(_) => RpcResponse::error("unexpected response message"),
            };
            write_message(&mut stream, &RpcMessage::response(message.id, response)).await?;
        }
    }
}

/// A TCP server speaking the RPC channel.
pub struct RpcServer {
    server: TcpServer,
}

impl RpcServer {
    pub fn new(name: &'static str, bind_addr: SocketAddr, handler: Arc<dyn RpcHandler>) -> Self {
        Self {
            server: TcpServer::new(name, bind_addr, Arc::new(RpcConnections { handler })),
        }
    }

    pub async fn start(&self) -> RosResult<SocketAddr> {
        self.server.start().await
    }

    pub fn local_addr(&self) -> RosResult<SocketAddr> {
        self.server.local_addr()
    }

    pub fn is_running(&self) -> bool {
        self.server.is_running()
    }

    pub async fn shutdown(&self) -> RosResult<()> {
        self.server.shutdown().await
    }
}
