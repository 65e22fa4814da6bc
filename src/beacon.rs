//! UDP multicast presence beacon.
//!
//! The beacon announces this host with a terse `infoshort` packet, either
//! every `multicast_dtbeacon` seconds or as soon as something asks for it
//! (a local catalogue change or a `getinfo` from another host).  Inbound
//! datagrams are classified into [`BeaconEvent`]s for the router; the full
//! catalogue of a remote host is never taken from multicast but fetched over
//! the control channel.
//!
//! The socket is a plain non-blocking std socket so the router can drain it
//! without ever waiting.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::codec::InfoPacket;
use crate::config::Config;
use crate::registry::HostRegistry;
use crate::types::{HostInfo, HostMessage, InfoPayload};

const MAX_DATAGRAM: usize = 65_507;

/// Datagrams read per router tick; the rest wait for the next tick.
pub const MAX_DATAGRAMS_PER_DRAIN: usize = 64;

/// What the router has to do after an inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconEvent {
    /// Fetch the full info of a remote host.
    Query { uuid: String, rep_url: String },
    /// A remote host announced its shutdown and was tombstoned.
    Stopped { uuid: String },
}

pub struct Beacon {
    socket: Option<UdpSocket>,
    group: SocketAddr,
    host: HostInfo,
    listen: bool,
    send: bool,
    interval: Option<Duration>,
    last_sent: Option<Instant>,
    send_now: bool,
    buf: Vec<u8>,
}

impl Beacon {
    pub fn new(config: &Config, host: HostInfo) -> io::Result<Self> {
        let group = SocketAddrV4::new(config.multicast_address, config.multicast_port);
        let socket = if config.multicast_listen || config.multicast_send {
            Some(open_socket(group)?)
        } else {
            None
        };
        Ok(Self {
            socket,
            group: group.into(),
            host,
            listen: config.multicast_listen,
            send: config.multicast_send,
            interval: config.beacon_interval(),
            last_sent: None,
            send_now: false,
            buf: vec![0; MAX_DATAGRAM],
        })
    }

    /// Announce on the next poll regardless of the interval.
    pub fn request_send(&mut self) {
        self.send_now = true;
    }

    pub fn due(&self, now: Instant) -> bool {
        if self.send_now {
            return true;
        }
        match (self.interval, self.last_sent) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(interval), Some(last)) => now.duration_since(last) >= interval,
        }
    }

    /// Sends the presence beacon if it is due.
    pub fn poll_send(&mut self, info: &InfoPayload) {
        let now = Instant::now();
        if !self.due(now) {
            return;
        }
        self.send_now = false;
        self.last_sent = Some(now);
        self.send_packet(&InfoPacket::InfoShort(info.short()));
    }

    pub fn send_getinfo(&self) {
        self.send_packet(&InfoPacket::GetInfo(HostMessage {
            host: self.host.clone(),
        }));
    }

    pub fn send_stop(&self) {
        self.send_packet(&InfoPacket::Stop(HostMessage {
            host: self.host.clone(),
        }));
    }

    fn send_packet(&self, packet: &InfoPacket) {
        let Some(socket) = self.socket.as_ref().filter(|_| self.send) else {
            return;
        };
        let bytes = packet.encode();
        match socket.send_to(&bytes, self.group) {
            Ok(_) => debug!("Sent multicast {:?} ({} bytes)", packet.kind(), bytes.len()),
            Err(e) => info!("Multicast send of {:?} failed: {}", packet.kind(), e),
        }
    }

    /// Reads pending datagrams without blocking, at most
    /// [`MAX_DATAGRAMS_PER_DRAIN`] per call.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        match self.socket.as_ref().filter(|_| self.listen) {
            Some(socket) => read_datagrams(socket, &mut self.buf, MAX_DATAGRAMS_PER_DRAIN),
            None => Vec::new(),
        }
    }

    /// Classifies one inbound datagram.
    ///
    /// Our own packets are dropped.  `getinfo` schedules an announcement,
    /// `info`/`infoshort` ask for a query when the registry has nothing newer,
    /// and `stop` tombstones the sender.
    pub async fn process(&mut self, data: &[u8], registry: &HostRegistry) -> Option<BeaconEvent> {
        let packet = match InfoPacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping malformed multicast datagram: {}", e);
                return None;
            }
        };
        let uuid = packet.host().uuid.clone();
        if uuid == self.host.uuid {
            return None;
        }

        match packet {
            InfoPacket::GetInfo(_) => {
                debug!("getinfo from {}", uuid);
                self.request_send();
                None
            }
            InfoPacket::Info(info) | InfoPacket::InfoShort(info) => registry
                .observe_beacon(&info)
                .await
                .then(|| BeaconEvent::Query {
                    uuid,
                    rep_url: info.zmq_rep_url.clone(),
                }),
            InfoPacket::Stop(_) => {
                if registry.tombstone(&uuid).await {
                    Some(BeaconEvent::Stopped { uuid })
                } else {
                    None
                }
            }
        }
    }
}

fn read_datagrams(socket: &UdpSocket, buf: &mut [u8], limit: usize) -> Vec<Vec<u8>> {
    let mut datagrams = Vec::new();
    while datagrams.len() < limit {
        match socket.recv_from(buf) {
            Ok((n, _)) => datagrams.push(buf[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!("Multicast receive error: {}", e);
                break;
            }
        }
    }
    datagrams
}

fn open_socket(group: SocketAddrV4) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
    socket.bind(&bind.into())?;
    if let Err(e) = socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED) {
        warn!("Could not join multicast group {}: {}", group, e);
    }
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
