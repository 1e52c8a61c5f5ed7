//! Service servers and clients, generic over the request and response
//! message types.

use crate::manager::LocalService;
use async_trait::async_trait;
use bytes::Bytes;
use rosgraph_message::{MessageCodec, ServiceDescriptor};
use rosgraph_types::{GraphName, RosError, RosResult};
use rosgraph_wire::frame::{read_service_response, write_frame};
use rosgraph_wire::header::{CALLER_ID, MD5_CHECKSUM, PERSISTENT, SERVICE, TYPE};
use rosgraph_wire::{tcpros, ConnectionHeader, MasterClient, ServiceEndpoint};
use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

const REQUEST_TYPE: &str = "request_type";
const RESPONSE_TYPE: &str = "response_type";

/// Computes a response for each request. `Err` text is returned to the
/// caller as a service failure.
#[async_trait]
pub trait ServiceHandler<Req, Res>: Send + Sync + 'static {
    async fn handle(&self, request: Req) -> Result<Res, String>;
}

#[async_trait]
impl<Req, Res, F> ServiceHandler<Req, Res> for F
where
    Req: Send + 'static,
    Res: Send + 'static,
    F: Fn(Req) -> Result<Res, String> + Send + Sync + 'static,
{
    async fn handle(&self, request: Req) -> Result<Res, String> {
        self(request)
    }
}

fn check_descriptor<M: MessageCodec>(
    message: &M,
    expected: &rosgraph_message::TypeDescriptor,
) -> RosResult<()> {
    if message.descriptor().fingerprint() != expected.fingerprint() {
        return Err(RosError::mismatch(
            TYPE,
            expected.name(),
            message.descriptor().name(),
        ));
    }
    Ok(())
}

pub(crate) struct ServiceServerInner<Req, Res> {
    name: GraphName,
    caller_id: GraphName,
    descriptor: Arc<ServiceDescriptor>,
    handler: Box<dyn ServiceHandler<Req, Res>>,
    closed: AtomicBool,
    _types: PhantomData<fn(Req) -> Res>,
}

impl<Req: MessageCodec, Res: MessageCodec> ServiceServerInner<Req, Res> {
    pub(crate) fn new(
        name: GraphName,
        caller_id: GraphName,
        descriptor: Arc<ServiceDescriptor>,
        handler: impl ServiceHandler<Req, Res>,
    ) -> Self {
        Self {
            name,
            caller_id,
            descriptor,
            handler: Box::new(handler),
            closed: AtomicBool::new(false),
            _types: PhantomData,
        }
    }

    async fn invoke(&self, request: Bytes) -> Result<Bytes, String> {
        let request = Req::decode(self.descriptor.request(), &request)
            .map_err(|e| format!("invalid request: {e}"))?;
        let response = self.handler.handle(request).await?;
        check_descriptor(&response, self.descriptor.response()).map_err(|e| e.to_string())?;
        response.to_bytes().map_err(|e| e.to_string())
    }
}

#[async_trait]
impl<Req: MessageCodec, Res: MessageCodec> ServiceEndpoint for ServiceServerInner<Req, Res> {
    fn header(&self) -> ConnectionHeader {
        ConnectionHeader::new()
            .with(CALLER_ID, self.caller_id.as_str())
            .with(SERVICE, self.name.as_str())
            .with(TYPE, self.descriptor.name())
            .with(MD5_CHECKSUM, self.descriptor.fingerprint())
            .with(REQUEST_TYPE, self.descriptor.request().name())
            .with(RESPONSE_TYPE, self.descriptor.response().name())
    }

    async fn call(&self, request: Bytes) -> Result<Bytes, String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(format!("service {} is shutting down", self.name));
        }
        let outcome = self.invoke(request).await;
        if let Err(reason) = &outcome {
            debug!(service = %self.name, reason = %reason, "Service call failed");
        }
        outcome
    }
}

impl<Req: MessageCodec, Res: MessageCodec> LocalService for ServiceServerInner<Req, Res> {
    fn name(&self) -> &GraphName {
        &self.name
    }

    fn type_name(&self) -> &str {
        self.descriptor.name()
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn as_endpoint(self: Arc<Self>) -> Arc<dyn ServiceEndpoint> {
        self
    }
}

/// A service this node provides.
pub struct ServiceServer<Req, Res> {
    inner: Arc<ServiceServerInner<Req, Res>>,
}

impl<Req, Res> Clone for ServiceServer<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Req: MessageCodec, Res: MessageCodec> ServiceServer<Req, Res> {
    pub(crate) fn from_inner(inner: Arc<ServiceServerInner<Req, Res>>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &GraphName {
        &self.inner.name
    }

    pub fn descriptor(&self) -> &Arc<ServiceDescriptor> {
        &self.inner.descriptor
    }
}

/// Calls a service by name, looking its provider up in the registry.
///
/// A persistent client keeps its connection between calls and reconnects
/// after a failure; otherwise every call uses a fresh connection.
pub struct ServiceClient<Req, Res> {
    name: GraphName,
    caller_id: GraphName,
    descriptor: Arc<ServiceDescriptor>,
    master: MasterClient,
    persistent: bool,
    timeout: Duration,
    connection: tokio::sync::Mutex<Option<TcpStream>>,
    _types: PhantomData<fn(Req) -> Res>,
}

impl<Req: MessageCodec, Res: MessageCodec> ServiceClient<Req, Res> {
    pub(crate) fn new(
        name: GraphName,
        caller_id: GraphName,
        descriptor: Arc<ServiceDescriptor>,
        master: MasterClient,
        persistent: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            name,
            caller_id,
            descriptor,
            master,
            persistent,
            timeout,
            connection: tokio::sync::Mutex::new(None),
            _types: PhantomData,
        }
    }

    pub fn name(&self) -> &GraphName {
        &self.name
    }

    pub fn descriptor(&self) -> &Arc<ServiceDescriptor> {
        &self.descriptor
    }

    fn header(&self) -> ConnectionHeader {
        ConnectionHeader::new()
            .with(CALLER_ID, self.caller_id.as_str())
            .with(SERVICE, self.name.as_str())
            .with(TYPE, self.descriptor.name())
            .with(MD5_CHECKSUM, self.descriptor.fingerprint())
            .with(PERSISTENT, if self.persistent { "1" } else { "0" })
    }

    async fn open(&self) -> RosResult<TcpStream> {
        let addr = self.master.lookup_service(&self.name).await?;
        let (stream, _) = tcpros::connect(addr, &self.header(), self.timeout).await?;
        debug!(service = %self.name, addr = %addr, "Connected to service");
        Ok(stream)
    }

    /// Check that the service exists and speaks our types, without calling
    /// it.
    pub async fn probe(&self) -> RosResult<()> {
        let addr = self.master.lookup_service(&self.name).await?;
        let header = self.header().with(rosgraph_wire::header::PROBE, "1");
        tcpros::connect(addr, &header, self.timeout).await?;
        Ok(())
    }

    /// Send `request` and wait for the response. A failure reported by the
    /// service handler is returned as `ServiceFailed`.
    pub async fn call(&self, request: &Req) -> RosResult<Res> {
        check_descriptor(request, self.descriptor.request())?;
        let payload = request.to_bytes()?;

        let mut slot = self.connection.lock().await;
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => self.open().await?,
        };
        let exchange = async {
            write_frame(&mut stream, &payload).await?;
            read_service_response(&mut stream).await
        };
        let outcome = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RosError::Timeout {
                operation: format!("call {}", self.name),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };
        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) => {
                warn!(service = %self.name, error = %e, "Service call transport error");
                return Err(e);
            }
        };
        if self.persistent {
            *slot = Some(stream);
        }
        drop(slot);

        match reply {
            Ok(bytes) => Res::decode(self.descriptor.response(), &bytes),
            Err(reason) => Err(RosError::ServiceFailed(reason)),
        }
    }

    /// Drop a kept connection.
    pub async fn close(&self) {
        self.connection.lock().await.take();
    }
}
