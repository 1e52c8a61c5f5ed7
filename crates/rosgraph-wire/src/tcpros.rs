//! TCPROS server and client.
//!
//! The server reads a subscriber's or service client's connection header,
//! routes it by its `topic` or `service` key to a local endpoint, answers
//! with that endpoint's header and then attaches the socket: topic sockets
//! join an outgoing queue, service sockets enter a request loop.

use crate::frame::{read_frame, write_service_response};
use crate::handshake::Handshake;
use crate::header::{self, ConnectionHeader};
use crate::server::{ConnectionHandler, TcpServer};
use async_trait::async_trait;
use bytes::Bytes;
use rosgraph_types::{GraphName, RosError, RosResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A locally published topic as seen by the transport server.
#[async_trait]
pub trait TopicEndpoint: Send + Sync {
    /// Header sent to subscribers; its `type`/`md5sum` are verified against
    /// theirs.
    fn header(&self) -> ConnectionHeader;

    /// Take ownership of a verified subscriber connection.
    async fn attach(&self, stream: TcpStream, peer: SocketAddr) -> RosResult<()>;
}

/// A locally provided service as seen by the transport server.
#[async_trait]
pub trait ServiceEndpoint: Send + Sync {
    fn header(&self) -> ConnectionHeader;

    /// Handle one serialized request; `Err` carries the failure text sent to
    /// the caller.
    async fn call(&self, request: Bytes) -> Result<Bytes, String>;
}

/// Looks up local endpoints by name.
pub trait ConnectionRouter: Send + Sync + 'static {
    fn topic(&self, name: &GraphName) -> Option<Arc<dyn TopicEndpoint>>;
    fn service(&self, name: &GraphName) -> Option<Arc<dyn ServiceEndpoint>>;
}

enum Route {
    Topic(Arc<dyn TopicEndpoint>),
    Service(Arc<dyn ServiceEndpoint>),
}

struct TcpRosHandler {
    router: Arc<dyn ConnectionRouter>,
    handshake_timeout: Duration,
}

impl TcpRosHandler {
    fn route(&self, request: &ConnectionHeader) -> RosResult<(Route, ConnectionHeader)> {
        if request.get(header::CALLER_ID).is_none() {
            return Err(RosError::MalformedHeader("missing callerid".into()));
        }
        if let Some(topic) = request.get(header::TOPIC) {
            let name = GraphName::new(topic)?;
            let endpoint = self
                .router
                .topic(&name)
                .ok_or_else(|| RosError::NotRunning(format!("no publisher for topic {name}")))?;
            let reply = endpoint.header();
            return Ok((Route::Topic(endpoint), reply));
        }
        if let Some(service) = request.get(header::SERVICE) {
            let name = GraphName::new(service)?;
            let endpoint = self
                .router
                .service(&name)
                .ok_or_else(|| RosError::NotRunning(format!("no provider for service {name}")))?;
            let reply = endpoint.header();
            return Ok((Route::Service(endpoint), reply));
        }
        Err(RosError::MalformedHeader(
            "header names neither a topic nor a service".into(),
        ))
    }
}

#[async_trait]
impl ConnectionHandler for TcpRosHandler {
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> RosResult<()> {
        let mut route = None;
        let mut handshake = Handshake::new(self.handshake_timeout);
        let request = handshake
            .accept(&mut stream, |request| {
                let (r, reply) = self.route(request)?;
                route = Some(r);
                Ok(reply)
            })
            .await
            .map_err(|e| {
                warn!(peer = %peer, error = %e, "Rejected connection");
                e
            })?;
        let caller = request.get(header::CALLER_ID).unwrap_or("").to_string();

        match route {
            Some(Route::Topic(endpoint)) => {
                info!(peer = %peer, caller = %caller, topic = request.get(header::TOPIC).unwrap_or(""), "Subscriber connected");
                let _ = stream.set_nodelay(request.flag(header::TCP_NODELAY));
                endpoint.attach(stream, peer).await
            }
            Some(Route::Service(endpoint)) => {
                if request.flag(header::PROBE) {
                    debug!(peer = %peer, caller = %caller, "Service probe answered");
                    return Ok(());
                }
                debug!(peer = %peer, caller = %caller, service = request.get(header::SERVICE).unwrap_or(""), "Service client connected");
                serve_requests(stream, endpoint, shutdown).await
            }
            None => Err(RosError::MalformedHeader("connection was not routed".into())),
        }
    }
}

async fn serve_requests(
    mut stream: TcpStream,
    endpoint: Arc<dyn ServiceEndpoint>,
    mut shutdown: watch::Receiver<bool>,
) -> RosResult<()> {
    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            frame = read_frame(&mut stream) => match frame {
                Ok(bytes) => bytes,
                Err(RosError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            },
        };
        let outcome = endpoint.call(request).await;
        match &outcome {
            Ok(bytes) => write_service_response(&mut stream, Ok(bytes.as_ref())).await?,
            Err(text) => write_service_response(&mut stream, Err(text.as_str())).await?,
        }
    }
}

/// The node's TCPROS server.
pub struct TcpRosServer {
    server: TcpServer,
}

impl TcpRosServer {
    pub fn new(
        bind_addr: SocketAddr,
        router: Arc<dyn ConnectionRouter>,
        handshake_timeout: Duration,
    ) -> Self {
        let handler = Arc::new(TcpRosHandler {
            router,
            handshake_timeout,
        });
        Self {
            server: TcpServer::new("tcpros", bind_addr, handler),
        }
    }

    pub async fn start(&self) -> RosResult<SocketAddr> {
        self.server.start().await
    }

    pub fn local_addr(&self) -> RosResult<SocketAddr> {
        self.server.local_addr()
    }

    pub async fn shutdown(&self) -> RosResult<()> {
        self.server.shutdown().await
    }
}

/// Open a connection to `addr` and perform the initiating handshake.
///
/// Returns the stream, ready for streaming, and the peer's header.
pub async fn connect(
    addr: SocketAddr,
    local: &ConnectionHeader,
    timeout: Duration,
) -> RosResult<(TcpStream, ConnectionHeader)> {
    let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(RosError::Timeout {
                operation: format!("connect to {addr}"),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    };
    let _ = stream.set_nodelay(local.flag(header::TCP_NODELAY));
    let mut handshake = Handshake::new(timeout);
    let remote = handshake.initiate(&mut stream, local).await?;
    debug!(peer = %addr, "Handshake complete");
    Ok((stream, remote))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, read_service_response, write_frame};
    use crate::header::{CALLER_ID, MD5_CHECKSUM, PROBE, SERVICE, TOPIC, TYPE};
    use dashmap::DashMap;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    struct TestTopic {
        sockets: Mutex<Vec<TcpStream>>,
    }

    #[async_trait]
    impl TopicEndpoint for TestTopic {
        fn header(&self) -> ConnectionHeader {
            ConnectionHeader::new()
                .with(CALLER_ID, "/talker")
                .with(TOPIC, "/chatter")
                .with(TYPE, "std_msgs/String")
                .with(MD5_CHECKSUM, "abc")
        }

        async fn attach(&self, mut stream: TcpStream, _peer: SocketAddr) -> RosResult<()> {
            write_frame(&mut stream, b"welcome").await?;
            self.sockets.lock().unwrap().push(stream);
            Ok(())
        }
    }

    struct Doubler;

    #[async_trait]
    impl ServiceEndpoint for Doubler {
        fn header(&self) -> ConnectionHeader {
            ConnectionHeader::new()
                .with(CALLER_ID, "/server")
                .with(SERVICE, "/double")
                .with(TYPE, "test_ros/Double")
                .with(MD5_CHECKSUM, "def")
        }

        async fn call(&self, request: Bytes) -> Result<Bytes, String> {
            if request.is_empty() {
                return Err("empty request".into());
            }
            Ok(request.iter().map(|b| b * 2).collect::<Vec<u8>>().into())
        }
    }

    #[derive(Default)]
    struct TestRouter {
        topics: DashMap<GraphName, Arc<dyn TopicEndpoint>>,
        services: DashMap<GraphName, Arc<dyn ServiceEndpoint>>,
    }

    impl ConnectionRouter for TestRouter {
        fn topic(&self, name: &GraphName) -> Option<Arc<dyn TopicEndpoint>> {
            self.topics.get(name).map(|e| Arc::clone(e.value()))
        }

        fn service(&self, name: &GraphName) -> Option<Arc<dyn ServiceEndpoint>> {
            self.services.get(name).map(|e| Arc::clone(e.value()))
        }
    }

    async fn start() -> (TcpRosServer, SocketAddr) {
        let router = TestRouter::default();
        router.topics.insert(
            GraphName::new("/chatter").unwrap(),
            Arc::new(TestTopic {
                sockets: Mutex::new(Vec::new()),
            }),
        );
        router
            .services
            .insert(GraphName::new("/double").unwrap(), Arc::new(Doubler));
        let server = TcpRosServer::new(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(router),
            Duration::from_secs(1),
        );
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    fn subscriber_header(md5: &str) -> ConnectionHeader {
        ConnectionHeader::new()
            .with(CALLER_ID, "/listener")
            .with(TOPIC, "/chatter")
            .with(TYPE, "std_msgs/String")
            .with(MD5_CHECKSUM, md5)
    }

    #[tokio::test]
    async fn test_topic_connection_attaches() {
        let (_server, addr) = start().await;
        let (mut stream, reply) = connect(addr, &subscriber_header("abc"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.get(CALLER_ID), Some("/talker"));
        assert_eq!(read_frame(&mut stream).await.unwrap().as_ref(), b"welcome");
    }

    #[tokio::test]
    async fn test_mismatch_rejected_and_server_keeps_accepting() {
        let (_server, addr) = start().await;
        let err = assert_err!(connect(addr, &subscriber_header("zzz"), Duration::from_secs(1)).await);
        assert!(matches!(err, RosError::HandshakeMismatch { .. }));
        assert_ok!(connect(addr, &subscriber_header("*"), Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_unknown_topic_rejected() {
        let (_server, addr) = start().await;
        let header = subscriber_header("abc").with(TOPIC, "/nothing");
        let err = assert_err!(connect(addr, &header, Duration::from_secs(1)).await);
        match err {
            RosError::HandshakeMismatch { remote, .. } => assert!(remote.contains("/nothing")),
            other => panic!("expected error header, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_service_calls_and_failures() {
        let (_server, addr) = start().await;
        let header = ConnectionHeader::new()
            .with(CALLER_ID, "/client")
            .with(SERVICE, "/double")
            .with(TYPE, "test_ros/Double")
            .with(MD5_CHECKSUM, "def");
        let (mut stream, _) = connect(addr, &header, Duration::from_secs(1)).await.unwrap();

        write_frame(&mut stream, &[1, 2, 3]).await.unwrap();
        assert_eq!(
            read_service_response(&mut stream).await.unwrap(),
            Ok(Bytes::from_static(&[2, 4, 6]))
        );
        write_frame(&mut stream, &[]).await.unwrap();
        assert_eq!(
            read_service_response(&mut stream).await.unwrap(),
            Err("empty request".to_string())
        );
    }

    #[tokio::test]
    async fn test_probe_closes_after_header() {
        let (_server, addr) = start().await;
        let header = ConnectionHeader::new()
            .with(CALLER_ID, "/client")
            .with(SERVICE, "/double")
            .with(TYPE, "*")
            .with(MD5_CHECKSUM, "*")
            .with(PROBE, "1");
        let (mut stream, reply) = connect(addr, &header, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.get(TYPE), Some("test_ros/Double"));
        assert!(matches!(
            read_frame(&mut stream).await,
            Err(RosError::ConnectionClosed) | Err(RosError::Io(_))
        ));
    }
}
