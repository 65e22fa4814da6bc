//! ZeroMQ plumbing shared by the control and data channels.
//!
//! All sockets come from one process-wide [`zmq::Context`].  Inbound
//! messages are bounded twice: libzmq drops peers sending a frame above
//! [`MAX_FRAME_SIZE`], and [`recv_message`] keeps at most [`MAX_FRAMES`]
//! frames of a message, discarding the rest as they arrive.

use std::sync::OnceLock;
use std::time::Duration;

use log::debug;

use crate::config::PortRange;
use crate::error::{DecodeError, IoredError, Result};

/// Largest inbound frame accepted from a peer.
pub const MAX_FRAME_SIZE: i64 = 16 * 1024 * 1024;

/// Frames kept from one inbound message.
pub const MAX_FRAMES: usize = 8;

/// Sleep between two non-blocking receive attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How long a closed socket keeps flushing queued messages.
pub const LINGER: Duration = Duration::from_secs(1);

pub type Multipart = Vec<Vec<u8>>;

static CONTEXT: OnceLock<zmq::Context> = OnceLock::new();

pub fn context() -> &'static zmq::Context {
    CONTEXT.get_or_init(zmq::Context::new)
}

/// Clamps a duration to a ZMQ millisecond socket option.
pub fn millis(duration: Duration) -> i32 {
    duration.as_millis().min(i32::MAX as u128) as i32
}

/// Creates a socket with the inbound size limit and linger applied.
pub fn socket(kind: zmq::SocketType) -> Result<zmq::Socket> {
    let socket = context().socket(kind)?;
    socket.set_maxmsgsize(MAX_FRAME_SIZE)?;
    socket.set_linger(millis(LINGER))?;
    Ok(socket)
}

/// Renders a ZMQ tcp endpoint.
pub fn tcp_url(ip: &str, port: u16) -> String {
    format!("tcp://{}:{}", ip, port)
}

/// Binds `socket` on all interfaces to the first free port of `range`.
///
/// Ports are tried in order; running out of ports is fatal for the caller.
pub fn bind_first_free(socket: &zmq::Socket, name: &'static str, range: PortRange) -> Result<u16> {
    for port in range.ports() {
        match socket.bind(&tcp_url("*", port)) {
            Ok(()) => {
                debug!("Bound {} socket on port {}", name, port);
                return Ok(port);
            }
            Err(e) => debug!("Port {} unavailable for {} socket: {}", port, name, e),
        }
    }
    Err(IoredError::NoFreePort {
        socket: name,
        range: range.ports(),
    })
}

/// Receives one message.
///
/// `Ok(None)` means nothing arrived: no message was pending under
/// `zmq::DONTWAIT`, or the receive timeout expired.  A message with more than
/// [`MAX_FRAMES`] frames is consumed completely and reported as
/// [`DecodeError::Frame`], so the socket stays usable.
pub fn recv_message(socket: &zmq::Socket, flags: i32) -> Result<Option<Multipart>> {
    let first = match socket.recv_bytes(flags) {
        Ok(frame) => frame,
        Err(zmq::Error::EAGAIN) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut parts = vec![first];
    let mut discarded = 0usize;
    while socket.get_rcvmore()? {
        // Remaining frames of a message are already queued.
        let frame = socket.recv_bytes(0)?;
        if parts.len() < MAX_FRAMES {
            parts.push(frame);
        } else {
            discarded += 1;
        }
    }
    if discarded > 0 {
        return Err(DecodeError::Frame(format!(
            "{} frames, at most {} accepted",
            parts.len() + discarded,
            MAX_FRAMES
        ))
        .into());
    }
    Ok(Some(parts))
}
