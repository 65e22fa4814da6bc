//! Error types shared by the iored subsystems.

use std::ops::RangeInclusive;

use thiserror::Error;

/// Failure to parse a redvypr address string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("too many '{separator}' separators in address '{input}'")]
    Separator {
        separator: &'static str,
        input: String,
    },
    #[error("empty {field} field in address '{input}'")]
    EmptyField { field: &'static str, input: String },
}

/// Failure to decode untrusted wire data.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,
    #[error("unknown or truncated header")]
    UnknownHeader,
    #[error("invalid body: {0}")]
    Body(#[from] serde_json::Error),
    #[error("malformed frame: {0}")]
    Frame(String),
}

/// Errors raised by the iored subsystem itself.
#[derive(Debug, Error)]
pub enum IoredError {
    #[error("no free port for {socket} socket in range {}-{}", .range.start(), .range.end())]
    NoFreePort {
        socket: &'static str,
        range: RangeInclusive<u16>,
    },
    #[error("invalid url '{0}'")]
    InvalidUrl(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ZeroMQ error: {0}")]
    Zmq(#[from] zmq::Error),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("iored is not running")]
    NotRunning,
}

pub type Result<T, E = IoredError> = std::result::Result<T, E>;
