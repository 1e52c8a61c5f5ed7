//! Accept loop shared by the TCPROS and RPC servers.
//!
//! A [`TcpServer`] binds a listener, runs one accept loop and hands every
//! accepted connection to its [`ConnectionHandler`] on a task of its own.

use async_trait::async_trait;
use rosgraph_types::{RosError, RosResult};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Serves one accepted connection until it ends or `shutdown` flips.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> RosResult<()>;
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// A TCP listener with an explicit start/shutdown lifecycle.
pub struct TcpServer {
    name: &'static str,
    bind_addr: SocketAddr,
    handler: Arc<dyn ConnectionHandler>,
    running: Mutex<Option<Running>>,
}

impl TcpServer {
    pub fn new(name: &'static str, bind_addr: SocketAddr, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            name,
            bind_addr,
            handler,
            running: Mutex::new(None),
        }
    }

    /// Bind and start accepting. Fails with `AddressInUse` if already running
    /// or if the address cannot be bound.
    pub async fn start(&self) -> RosResult<SocketAddr> {
        if self.is_running() {
            return Err(RosError::AddressInUse(format!(
                "{} server already started",
                self.name
            )));
        }
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| RosError::AddressInUse(format!("{}: {e}", self.bind_addr)))?;
        let local_addr = listener.local_addr()?;

        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(RosError::AddressInUse(format!(
                "{} server already started",
                self.name
            )));
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            self.name,
            listener,
            Arc::clone(&self.handler),
            shutdown_rx,
        ));
        *running = Some(Running {
            local_addr,
            shutdown,
            accept_task,
        });
        info!(server = self.name, addr = %local_addr, "Listening");
        Ok(local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// The bound address; `NotRunning` before start or after shutdown.
    pub fn local_addr(&self) -> RosResult<SocketAddr> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|r| r.local_addr)
            .ok_or_else(|| RosError::NotRunning(format!("{} server", self.name)))
    }

    /// Stop accepting and signal every open connection to close.
    pub async fn shutdown(&self) -> RosResult<()> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| RosError::NotRunning(format!("{} server", self.name)))?;
        let _ = running.shutdown.send(true);
        let _ = running.accept_task.await;
        info!(server = self.name, addr = %running.local_addr, "Stopped");
        Ok(())
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(running) = self
            .running
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = running.shutdown.send(true);
            running.accept_task.abort();
        }
    }
}

async fn accept_loop(
    name: &'static str,
    listener: TcpListener,
    handler: Arc<dyn ConnectionHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(server = name, peer = %peer, "Accepted connection");
                    let handler = Arc::clone(&handler);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle_connection(stream, peer, shutdown).await {
                            debug!(server = name, peer = %peer, error = %e, "Connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!(server = name, error = %e, "Accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
        }
    }
}
