//! Data structures used throughout the iored subsystem.
//!
//! These types are serialised using [`serde`](https://serde.rs/) and
//! exchanged between hosts, either inside discovery packets or as data
//! packets on the pub/sub channel.  The queue types at the bottom of the
//! file ([`Command`], [`Egress`]) are the contract with the local device
//! wrappers that feed and consume the router.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Catalogue of published devices: full address string → metadata.
pub type Catalogue = BTreeMap<String, Value>;

/// Current unix time in seconds.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Identity of one running instance.
///
/// Created once at start-up and embedded in every outgoing packet and
/// discovery message.  The uuid is regenerated on every process start so a
/// restarted host is a new peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub addr: String,
    pub uuid: String,
    pub tstart: f64,
}

impl HostInfo {
    /// Builds the host info of this process, reachable at `addr`.
    pub fn local(addr: impl Into<String>) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".into());
        Self {
            hostname,
            addr: addr.into(),
            uuid: Uuid::new_v4().to_string(),
            tstart: now(),
        }
    }
}

/// The unit of data exchanged between devices and hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    pub host: HostInfo,
    pub device: String,
    pub t: f64,
    #[serde(default)]
    pub numpacket: u64,
    /// Device specific payload keys.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl DataPacket {
    pub fn new(host: HostInfo, device: impl Into<String>) -> Self {
        Self {
            host,
            device: device.into(),
            t: now(),
            numpacket: 0,
            data: Map::new(),
        }
    }

    /// Adds a payload key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Body of `info` and `infoshort` discovery packets.
///
/// The short variant leaves `devices` and `hostinfo_opt` empty to keep
/// multicast datagrams small; the full catalogue is fetched over the
/// control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoPayload {
    pub host: HostInfo,
    pub zmq_pub_url: String,
    pub zmq_rep_url: String,
    pub tinfo: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub devices: Catalogue,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub hostinfo_opt: Map<String, Value>,
}

impl InfoPayload {
    /// Copy without catalogue or optional host info.
    pub fn short(&self) -> Self {
        Self {
            devices: Catalogue::new(),
            hostinfo_opt: Map::new(),
            ..self.clone()
        }
    }
}

/// Body of `getinfo` and `stop` discovery packets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMessage {
    pub host: HostInfo,
}

/// Commands accepted on the router ingress queue.
#[derive(Debug, Clone)]
pub enum Command {
    /// Publish a local data packet.
    Data(DataPacket),
    /// Add a local subscription pattern (redvypr address string).
    Subscribe(String),
    /// Remove a local subscription pattern.
    Unsubscribe(String),
    /// Open a data connection to a remote host by uuid.
    Connect(String),
    /// Close the data connection to a remote host.
    Disconnect(String),
    /// Fetch the full info of the host behind a REP url.
    Query(String),
    /// Replace the optional host metadata.
    HostinfoOpt(Map<String, Value>),
    /// Replace the local device catalogue.
    DeviceinfoAll(Catalogue),
    /// Ask every host on the multicast group to announce itself.
    GetInfo,
    /// Liveness check of a REP url.
    Ping(String),
    Stop,
}

/// Connection state of a remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Known,
    Connecting,
    Connected,
    Disconnected,
}

/// Status change of a remote host connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub uuid: String,
    pub state: ConnectionState,
}

/// Messages delivered on the router egress queue.
#[derive(Debug, Clone)]
pub enum Egress {
    /// A data packet received from a remote host.
    Packet(DataPacket),
    /// A remote host changed its connection state.
    DeviceStatus(DeviceStatus),
    /// Full info of a remote host was fetched.
    HostInfo(InfoPayload),
    /// A remote subscriber changed its filter on our publisher.
    Subscription { subscribe: bool, topic: String },
    /// Reply to [`Command::Ping`].
    Pong { url: String, alive: bool },
    /// The router has shut down.
    Stopped,
}
