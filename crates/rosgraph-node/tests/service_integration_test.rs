//! End-to-end service tests over a real registry and loopback sockets.

use rosgraph_master::MasterServer;
use rosgraph_message::{MessageRegistry, RuntimeMessage, ServiceDescriptor};
use rosgraph_node::Node;
use rosgraph_types::config::{MasterConfig, NodeConfig};
use rosgraph_types::{GraphName, RosError};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

const ADD_TWO_INTS: &str = "test_ros/AddTwoInts";
const ADD_TWO_FLOATS: &str = "test_ros/AddTwoFloats";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn registry() -> Arc<MessageRegistry> {
    let messages = MessageRegistry::with_std_msgs();
    messages
        .register_service(ADD_TWO_INTS, "int64 a\nint64 b\n---\nint64 sum")
        .unwrap();
    messages
        .register_service(ADD_TWO_FLOATS, "float64 a\nfloat64 b\n---\nfloat64 sum")
        .unwrap();
    Arc::new(messages)
}

async fn start_master() -> MasterServer {
    MasterServer::start(MasterConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        rpc_timeout_ms: 1_000,
    })
    .await
    .unwrap()
}

async fn start_node(master: &MasterServer, name: &str, messages: &Arc<MessageRegistry>) -> Node {
    let config = NodeConfig::for_node(name, master.addr()).unwrap();
    Node::start(config, Arc::clone(messages)).await.unwrap()
}

fn adder(
    descriptor: Arc<ServiceDescriptor>,
) -> impl Fn(RuntimeMessage) -> Result<RuntimeMessage, String> + Send + Sync + 'static {
    move |request: RuntimeMessage| {
        let operand = |field: &str| {
            request
                .get(field)
                .ok()
                .and_then(|v| v.as_i64())
                .ok_or_else(|| format!("missing {field}"))
        };
        let sum = operand("a")?
            .checked_add(operand("b")?)
            .ok_or_else(|| "overflow".to_string())?;
        RuntimeMessage::new(Arc::clone(descriptor.response()))
            .with("sum", sum)
            .map_err(|e| e.to_string())
    }
}

fn request(descriptor: &ServiceDescriptor, a: i64, b: i64) -> RuntimeMessage {
    RuntimeMessage::new(Arc::clone(descriptor.request()))
        .with("a", a)
        .unwrap()
        .with("b", b)
        .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_add_two_ints() {
    let master = start_master().await;
    let messages = registry();
    let srv = messages.service(ADD_TWO_INTS).unwrap();
    let server = start_node(&master, "adder", &messages).await;
    let client = start_node(&master, "caller", &messages).await;

    server
        .advertise_service::<RuntimeMessage, RuntimeMessage>(
            "add_two_ints",
            ADD_TWO_INTS,
            adder(Arc::clone(&srv)),
        )
        .await
        .unwrap();
    assert_eq!(
        master
            .registry()
            .system_state()
            .provider_of(&GraphName::new("/add_two_ints").unwrap()),
        Some(GraphName::new("/adder").unwrap())
    );

    let add = client
        .service_client::<RuntimeMessage, RuntimeMessage>("add_two_ints", ADD_TWO_INTS, false)
        .unwrap();
    assert_ok!(add.probe().await);
    let response = assert_ok!(add.call(&request(&srv, 2, 2)).await);
    assert_eq!(response.get("sum").unwrap().as_i64(), Some(4));
}

#[tokio::test]
async fn test_persistent_client_reuses_connection() {
    let master = start_master().await;
    let messages = registry();
    let srv = messages.service(ADD_TWO_INTS).unwrap();
    let node = start_node(&master, "adder", &messages).await;
    node.advertise_service::<RuntimeMessage, RuntimeMessage>(
        "add_two_ints",
        ADD_TWO_INTS,
        adder(Arc::clone(&srv)),
    )
    .await
    .unwrap();

    let add = node
        .service_client::<RuntimeMessage, RuntimeMessage>("add_two_ints", ADD_TWO_INTS, true)
        .unwrap();
    for (a, b) in [(1, 2), (40, 2), (-5, 5)] {
        let response = assert_ok!(add.call(&request(&srv, a, b)).await);
        assert_eq!(response.get("sum").unwrap().as_i64(), Some(a + b));
    }
    add.close().await;
}

#[tokio::test]
async fn test_handler_failure_reaches_caller() {
    let master = start_master().await;
    let messages = registry();
    let srv = messages.service(ADD_TWO_INTS).unwrap();
    let node = start_node(&master, "adder", &messages).await;
    node.advertise_service::<RuntimeMessage, RuntimeMessage>(
        "add_two_ints",
        ADD_TWO_INTS,
        adder(Arc::clone(&srv)),
    )
    .await
    .unwrap();

    let add = node
        .service_client::<RuntimeMessage, RuntimeMessage>("add_two_ints", ADD_TWO_INTS, false)
        .unwrap();
    match add.call(&request(&srv, i64::MAX, 1)).await {
        Err(RosError::ServiceFailed(reason)) => assert_eq!(reason, "overflow"),
        other => panic!("expected service failure, got {other:?}"),
    }

    // The server is still usable.
    let response = add.call(&request(&srv, 3, 4)).await.unwrap();
    assert_eq!(response.get("sum").unwrap().as_i64(), Some(7));
}

#[tokio::test]
async fn test_mismatched_client_fails_handshake() {
    let master = start_master().await;
    let messages = registry();
    let srv = messages.service(ADD_TWO_INTS).unwrap();
    let floats = messages.service(ADD_TWO_FLOATS).unwrap();
    let node = start_node(&master, "adder", &messages).await;
    node.advertise_service::<RuntimeMessage, RuntimeMessage>(
        "add_two_ints",
        ADD_TWO_INTS,
        adder(Arc::clone(&srv)),
    )
    .await
    .unwrap();

    let wrong = node
        .service_client::<RuntimeMessage, RuntimeMessage>("add_two_ints", ADD_TWO_FLOATS, false)
        .unwrap();
    let request = RuntimeMessage::new(Arc::clone(floats.request()))
        .with("a", 2.0f64)
        .unwrap()
        .with("b", 2.0f64)
        .unwrap();
    let err = assert_err!(wrong.call(&request).await);
    assert!(matches!(err, RosError::HandshakeMismatch { .. }), "{err}");
}

#[tokio::test]
async fn test_unknown_service_and_unadvertise() {
    let master = start_master().await;
    let messages = registry();
    let srv = messages.service(ADD_TWO_INTS).unwrap();
    let node = start_node(&master, "adder", &messages).await;

    let add = node
        .service_client::<RuntimeMessage, RuntimeMessage>("add_two_ints", ADD_TWO_INTS, false)
        .unwrap();
    assert!(matches!(
        add.call(&request(&srv, 1, 1)).await,
        Err(RosError::RegistryFault { .. })
    ));

    node.advertise_service::<RuntimeMessage, RuntimeMessage>(
        "add_two_ints",
        ADD_TWO_INTS,
        adder(Arc::clone(&srv)),
    )
    .await
    .unwrap();
    assert!(matches!(
        node.advertise_service::<RuntimeMessage, RuntimeMessage>(
            "add_two_ints",
            ADD_TWO_INTS,
            adder(Arc::clone(&srv)),
        )
        .await,
        Err(RosError::AddressInUse(_))
    ));

    assert!(node.unadvertise_service("add_two_ints").await.unwrap());
    assert!(matches!(
        add.call(&request(&srv, 1, 1)).await,
        Err(RosError::RegistryFault { .. })
    ));
}
