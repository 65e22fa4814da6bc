//! Discovery and pub/sub data routing between redvypr hosts.
//!
//! Hosts announce themselves over UDP multicast, exchange their device
//! catalogues over a request/reply control channel and stream data packets
//! to each other over a publish/subscribe channel filtered by address
//! prefixes.  [`Iored`] is the entry point; device wrappers talk to it
//! through its ingress and egress queues.

pub mod address;
pub mod beacon;
pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod pubsub;
pub mod registry;
pub mod remote;
pub mod router;
pub mod transport;
pub mod types;

pub use address::{AddressStyle, RedvyprAddress};
pub use config::{CompactionPolicy, Config, PortRange};
pub use error::{AddressError, DecodeError, IoredError};
pub use registry::{HostRegistry, RemoteHostRecord};
pub use router::Iored;
pub use types::{Command, ConnectionState, DataPacket, DeviceStatus, Egress, HostInfo};
