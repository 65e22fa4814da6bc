//! Publish/subscribe data channel.
//!
//! A host owns a single [`Publisher`], a ZeroMQ XPUB socket shared by all
//! outgoing data.  Each message is three frames, `[topic, "t<unix time>",
//! payload]`, and libzmq only forwards it to subscribers holding a filter
//! that is a prefix of the topic.  Filter changes of remote subscribers are
//! read back from the XPUB socket as [`SubscriptionEvent`]s.
//!
//! A [`Subscriber`] is owned by exactly one remote connection task.  Its
//! filter set can change at any time without reconnecting, and
//! [`Subscriber::recv`] polls without blocking the runtime and returns after
//! a bounded wait, so the owner can keep serving its command queue.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::{sleep, Instant};

use crate::config::PortRange;
use crate::error::{DecodeError, IoredError, Result};
use crate::transport::{self, bind_first_free, recv_message, Multipart, POLL_INTERVAL};

const SUBSCRIBE: u8 = 1;
const UNSUBSCRIBE: u8 = 0;

/// Filter change of a remote subscriber, as seen by the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEvent {
    pub subscribe: bool,
    pub topic: Vec<u8>,
}

impl SubscriptionEvent {
    fn parse(frame: &[u8]) -> Option<Self> {
        match frame.split_first() {
            Some((&SUBSCRIBE, topic)) => Some(Self {
                subscribe: true,
                topic: topic.to_vec(),
            }),
            Some((&UNSUBSCRIBE, topic)) => Some(Self {
                subscribe: false,
                topic: topic.to_vec(),
            }),
            _ => None,
        }
    }
}

/// One received data message.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub topic: Vec<u8>,
    pub t: Option<f64>,
    pub payload: Vec<u8>,
}

pub struct Publisher {
    socket: zmq::Socket,
    port: u16,
}

impl Publisher {
    /// Binds the publisher on the first free port of `range`.
    pub fn bind(range: PortRange) -> Result<Self> {
        let socket = transport::socket(zmq::XPUB)?;
        let port = bind_first_free(&socket, "pub", range)?;
        info!("Publisher listening on port {}", port);
        Ok(Self { socket, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Queues a message for every matching subscriber.  Never blocks;
    /// subscribers above their high-water mark miss the message.
    pub fn publish(&self, topic: &[u8], t: f64, payload: &[u8]) -> Result<()> {
        let t = format!("t{}", t);
        self.socket
            .send_multipart([topic, t.as_bytes(), payload], zmq::DONTWAIT)?;
        Ok(())
    }

    /// Drains up to `limit` pending subscription notifications.
    pub fn poll_subscriptions(&self, limit: usize) -> Vec<SubscriptionEvent> {
        let mut events = Vec::new();
        for _ in 0..limit {
            match recv_message(&self.socket, zmq::DONTWAIT) {
                Ok(Some(message)) => match SubscriptionEvent::parse(&message[0]) {
                    Some(event) => events.push(event),
                    None => debug!("Ignoring unexpected message on publisher socket"),
                },
                Ok(None) => break,
                Err(IoredError::Decode(e)) => debug!("Ignoring malformed notification: {}", e),
                Err(e) => {
                    warn!("Publisher receive error: {}", e);
                    break;
                }
            }
        }
        events
    }

    /// Closes the socket.  Queued messages are still flushed for up to
    /// [`transport::LINGER`].
    pub fn close(self) {
        debug!("Closing publisher on port {}", self.port);
    }
}

pub struct Subscriber {
    url: String,
    socket: zmq::Socket,
}

impl Subscriber {
    /// Connects to the publisher at `url`.  ZeroMQ connects in the
    /// background and reconnects on its own, so only a malformed url fails
    /// here.
    pub fn connect(url: &str) -> Result<Self> {
        let socket = transport::socket(zmq::SUB)?;
        socket.set_linger(0)?;
        socket.connect(url)?;
        Ok(Self {
            url: url.to_string(),
            socket,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Adds a topic prefix.  Prefixes are counted: each subscribe needs its
    /// own unsubscribe.
    pub fn subscribe(&self, prefix: &[u8]) -> Result<()> {
        self.socket.set_subscribe(prefix)?;
        Ok(())
    }

    pub fn unsubscribe(&self, prefix: &[u8]) -> Result<()> {
        self.socket.set_unsubscribe(prefix)?;
        Ok(())
    }

    /// Waits up to `limit` for the next message.
    ///
    /// `Ok(None)` means nothing arrived in time.  A malformed message is
    /// reported as [`IoredError::Decode`] and does not affect the stream.
    pub async fn recv(&mut self, limit: Duration) -> Result<Option<DataMessage>> {
        let deadline = Instant::now() + limit;
        loop {
            let received = recv_message(&self.socket, zmq::DONTWAIT)?;
            if let Some(message) = received {
                return parse_data_message(message).map(Some);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

fn parse_data_message(message: Multipart) -> Result<DataMessage> {
    let [topic, t, payload]: [Vec<u8>; 3] = message.try_into().map_err(|m: Multipart| {
        IoredError::Decode(DecodeError::Frame(format!("{} frames, expected 3", m.len())))
    })?;
    let t = std::str::from_utf8(&t)
        .ok()
        .and_then(|s| s.strip_prefix('t'))
        .and_then(|s| s.parse().ok());
    Ok(DataMessage { topic, t, payload })
}
