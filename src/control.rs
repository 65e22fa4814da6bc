//! Request/reply control channel.
//!
//! Every host runs one [`ControlServer`], a ZeroMQ REP socket answering:
//!
//! * `redvypr getinfo` with the full `info` packet (host, catalogue, urls),
//! * `ping` with `pong`,
//! * the one-time teardown token with `stopping`, after which the server
//!   stops serving and releases its port,
//! * anything else by echoing it back.
//!
//! The client side ([`query`], [`ping`], [`teardown`]) uses a fresh REQ
//! socket per exchange, bounded by a receive timeout; an unreachable host is
//! reported as absent, never as an error.

use std::io;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{InfoKind, InfoPacket};
use crate::config::PortRange;
use crate::error::{IoredError, Result};
use crate::transport::{self, bind_first_free, millis, recv_message, Multipart};
use crate::types::InfoPayload;

pub use crate::transport::tcp_url;

pub const PING: &[u8] = b"ping";
pub const PONG: &[u8] = b"pong";
pub const STOPPING: &[u8] = b"stopping";

/// How often the server looks at its stop token while idle.
const IDLE_CHECK: Duration = Duration::from_millis(100);

/// Generates a random teardown token.
pub fn teardown_token() -> String {
    hex::encode(rand::thread_rng().gen::<[u8; 16]>())
}

pub struct ControlServer {
    socket: zmq::Socket,
    port: u16,
    token: String,
    info: watch::Receiver<InfoPayload>,
    stop: CancellationToken,
}

impl ControlServer {
    pub fn bind(range: PortRange, info: watch::Receiver<InfoPayload>) -> Result<Self> {
        let socket = transport::socket(zmq::REP)?;
        socket.set_rcvtimeo(millis(IDLE_CHECK))?;
        let port = bind_first_free(&socket, "rep", range)?;
        Ok(Self {
            socket,
            port,
            token: teardown_token(),
            info,
            stop: CancellationToken::new(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Token that stops the server without the teardown handshake.
    pub fn stopper(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Serves requests on a blocking thread until stopped.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.serve())
    }

    fn serve(self) {
        info!("Control server listening on port {}", self.port);
        while !self.stop.is_cancelled() {
            let (reply, stopping) = match recv_message(&self.socket, 0) {
                Ok(Some(request)) => self.reply(request),
                Ok(None) => continue,
                Err(IoredError::Decode(e)) => {
                    // REP must answer before it can receive again.
                    warn!("Malformed control request: {}", e);
                    (vec![Vec::new()], false)
                }
                Err(e) => {
                    error!("Control server receive failed: {}", e);
                    break;
                }
            };
            if let Err(e) = self.socket.send_multipart(reply, 0) {
                warn!("Failed to send control reply: {}", e);
            }
            if stopping {
                info!("Teardown token received");
                break;
            }
        }
        info!("Control server on port {} stopped", self.port);
    }

    fn reply(&self, request: Multipart) -> (Multipart, bool) {
        let body = request.first().map(Vec::as_slice).unwrap_or_default();
        if body == self.token.as_bytes() {
            return (vec![STOPPING.to_vec()], true);
        }
        if body == PING {
            return (vec![PONG.to_vec()], false);
        }
        if let Ok((InfoKind::GetInfo, _)) = InfoKind::split(body) {
            let info = self.info.borrow().clone();
            return (vec![InfoPacket::Info(info).encode()], false);
        }
        (request, false)
    }
}

/// Sends one request and waits up to `limit` for its reply.
pub async fn request(url: &str, parts: &[&[u8]], limit: Duration) -> Result<Multipart> {
    let url = url.to_string();
    let parts: Multipart = parts.iter().map(|p| p.to_vec()).collect();
    tokio::task::spawn_blocking(move || exchange(&url, &parts, limit))
        .await
        .map_err(|e| IoredError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

fn exchange(url: &str, parts: &[Vec<u8>], limit: Duration) -> Result<Multipart> {
    let socket = transport::socket(zmq::REQ)?;
    socket.set_linger(0)?;
    socket.set_sndtimeo(millis(limit))?;
    socket.set_rcvtimeo(millis(limit))?;
    socket.connect(url)?;
    socket.send_multipart(parts.iter().map(Vec::as_slice), 0)?;
    recv_message(&socket, 0)?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::TimedOut, format!("no reply from {}", url)).into()
    })
}

/// Fetches the full info of the host serving `url`.
pub async fn query(url: &str, limit: Duration) -> Option<InfoPayload> {
    let reply = match request(url, &[InfoKind::GetInfo.header()], limit).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!("Query of {} failed: {}", url, e);
            return None;
        }
    };
    let body = reply.first()?;
    match InfoPacket::decode(body) {
        Ok(InfoPacket::Info(info)) => Some(info),
        Ok(other) => {
            warn!("Query of {} answered with {:?}", url, other.kind());
            None
        }
        Err(e) => {
            warn!("Malformed info from {}: {}", url, e);
            None
        }
    }
}

pub async fn ping(url: &str, limit: Duration) -> bool {
    match request(url, &[PING], limit).await {
        Ok(reply) => reply.first().is_some_and(|b| b == PONG),
        Err(e) => {
            debug!("Ping of {} failed: {}", url, e);
            false
        }
    }
}

/// Asks the control server at `url` to shut down.
pub async fn teardown(url: &str, token: &str, limit: Duration) -> bool {
    match request(url, &[token.as_bytes()], limit).await {
        Ok(reply) => reply.first().is_some_and(|b| b == STOPPING),
        Err(e) => {
            warn!("Teardown of control server {} failed: {}", url, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MAX_FRAMES;
    use crate::types::{Catalogue, HostInfo};
    use tokio::time::timeout;

    fn info() -> InfoPayload {
        let mut devices = Catalogue::new();
        devices.insert("temp:h@127.0.0.1::u".into(), serde_json::Value::Null);
        InfoPayload {
            host: HostInfo {
                hostname: "h".into(),
                addr: "127.0.0.1".into(),
                uuid: "u".into(),
                tstart: 1.0,
            },
            zmq_pub_url: "tcp://127.0.0.1:1".into(),
            zmq_rep_url: "tcp://127.0.0.1:2".into(),
            tinfo: 2.0,
            devices,
            hostinfo_opt: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn serves_info_ping_echo_and_teardown() {
        let (tx, rx) = watch::channel(info());
        let server = ControlServer::bind(PortRange::new(28100, 28120), rx).unwrap();
        let url = tcp_url("127.0.0.1", server.port());
        let token = server.token().to_string();
        let handle = server.spawn();
        let limit = Duration::from_secs(2);

        assert_eq!(query(&url, limit).await, Some(info()));

        let mut updated = info();
        updated.tinfo = 3.0;
        tx.send(updated.clone()).unwrap();
        assert_eq!(query(&url, limit).await, Some(updated));

        assert!(ping(&url, limit).await);
        let echo = request(&url, &[b"hello", b"world"], limit).await.unwrap();
        assert_eq!(echo, vec![b"hello".to_vec(), b"world".to_vec()]);

        assert!(teardown(&url, &token, limit).await);
        timeout(limit, handle).await.unwrap().unwrap();
        assert_eq!(query(&url, Duration::from_millis(300)).await, None);
    }

    #[tokio::test]
    async fn oversized_request_is_answered_and_server_keeps_serving() {
        let (_tx, rx) = watch::channel(info());
        let server = ControlServer::bind(PortRange::new(28100, 28120), rx).unwrap();
        let url = tcp_url("127.0.0.1", server.port());
        let stop = server.stopper();
        let handle = server.spawn();
        let limit = Duration::from_secs(2);

        let frames: Vec<&[u8]> = (0..MAX_FRAMES + 2).map(|_| &b"x"[..]).collect();
        let reply = request(&url, &frames, limit).await.unwrap();
        assert_eq!(reply, vec![Vec::<u8>::new()]);
        assert!(ping(&url, limit).await);

        stop.cancel();
        timeout(limit, handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unreachable_host_is_absent() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let url = tcp_url("127.0.0.1", port);
        assert_eq!(query(&url, Duration::from_millis(300)).await, None);
        assert!(!ping(&url, Duration::from_millis(300)).await);
        assert!(!ping("not a url", Duration::from_millis(300)).await);
    }

    #[test]
    fn occupied_range_is_fatal() {
        let held: Vec<_> = (28130..=28132)
            .map(|port| std::net::TcpListener::bind(("0.0.0.0", port)).unwrap())
            .collect();
        let (_tx, rx) = watch::channel(info());
        let result = ControlServer::bind(PortRange::new(28130, 28132), rx);
        assert!(matches!(result, Err(IoredError::NoFreePort { socket: "rep", .. })));
        drop(held);
    }
}
