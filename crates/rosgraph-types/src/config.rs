//! Configuration for nodes and the registry, loaded from
//! `~/.rosgraph/config.toml` with defaults.

use crate::error::{RosError, RosResult};
use crate::graph_name::GraphName;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default registry port.
pub const DEFAULT_MASTER_PORT: u16 = 11311;

/// Default capacity of an incoming message buffer.
pub const DEFAULT_INCOMING_CAPACITY: usize = 8192;

/// Default capacity of each listener's delivery queue.
pub const DEFAULT_LISTENER_CAPACITY: usize = 128;

fn default_master_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], DEFAULT_MASTER_PORT))
}

fn ephemeral_loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Settings for one node process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name; relative names are placed in `namespace`.
    pub name: GraphName,
    /// Namespace relative names resolve against.
    pub namespace: GraphName,
    /// Address of the registry's RPC endpoint.
    pub master_addr: SocketAddr,
    /// Bind address of this node's RPC endpoint.
    pub rpc_bind: SocketAddr,
    /// Bind address of this node's TCPROS server.
    pub tcpros_bind: SocketAddr,
    /// Deadline for one side of a connection header exchange.
    pub handshake_timeout_ms: u64,
    /// Deadline for one RPC round trip.
    pub rpc_timeout_ms: u64,
    /// Deadline for writing one frame to one subscriber.
    pub write_timeout_ms: u64,
    /// Capacity of each subscription's incoming buffer.
    pub incoming_queue_capacity: usize,
    /// Capacity of each listener's delivery queue.
    pub listener_queue_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: GraphName::new("rosgraph_node").unwrap_or_else(|_| GraphName::root()),
            namespace: GraphName::root(),
            master_addr: default_master_addr(),
            rpc_bind: ephemeral_loopback(),
            tcpros_bind: ephemeral_loopback(),
            handshake_timeout_ms: 5_000,
            rpc_timeout_ms: 5_000,
            write_timeout_ms: 2_000,
            incoming_queue_capacity: DEFAULT_INCOMING_CAPACITY,
            listener_queue_capacity: DEFAULT_LISTENER_CAPACITY,
        }
    }
}

impl NodeConfig {
    /// Default settings for a node called `name` talking to `master_addr`.
    pub fn for_node(name: &str, master_addr: SocketAddr) -> RosResult<Self> {
        Ok(Self {
            name: GraphName::new(name)?,
            master_addr,
            ..Self::default()
        })
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Reject settings that cannot work at runtime.
    pub fn validate(&self) -> RosResult<()> {
        if self.incoming_queue_capacity == 0 {
            return Err(RosError::Config(
                "incoming_queue_capacity must be at least 1".into(),
            ));
        }
        if self.listener_queue_capacity == 0 {
            return Err(RosError::Config(
                "listener_queue_capacity must be at least 1".into(),
            ));
        }
        if self.name.is_root() {
            return Err(RosError::Config("node name cannot be the root".into()));
        }
        Ok(())
    }
}

/// Settings for the registry process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Bind address of the registry's RPC endpoint.
    pub bind_addr: SocketAddr,
    /// Deadline for push notifications to node endpoints.
    pub rpc_timeout_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_master_addr(),
            rpc_timeout_ms: 5_000,
        }
    }
}

impl MasterConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Root of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RosConfig {
    pub node: NodeConfig,
    pub master: MasterConfig,
}

/// `~/.rosgraph/config.toml`, or `./config.toml` without a home directory.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".rosgraph"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

/// Load configuration from a TOML file, falling back to defaults when the
/// file is missing or unreadable.
pub fn load_config(path: Option<&Path>) -> RosConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return RosConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<RosConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                RosConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            RosConfig::default()
        }
    }
}

/// The `[node]` section of the configuration file.
pub fn load_node_config(path: Option<&Path>) -> NodeConfig {
    load_config(path).node
}

/// The `[master]` section of the configuration file.
pub fn load_master_config(path: Option<&Path>) -> MasterConfig {
    load_config(path).master
}
