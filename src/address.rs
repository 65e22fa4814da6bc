//! Redvypr addresses.
//!
//! An address identifies a device or datastream as
//! `device:host@ip::uuid[/datakey]`.  Every field may be the wildcard `*`,
//! and trailing fields may be omitted (`temp`, `temp:*`, `temp:lab@*`), in
//! which case they are wildcards as well.
//!
//! Matching is field-wise: two addresses match when, for every field, the
//! values are equal or at least one of them is a wildcard.  The relation is
//! therefore symmetric, including for wildcards on either side; a missing
//! datakey counts as a wildcard.
//!
//! Publisher topics stop at the device, so a datakey never narrows what is
//! subscribed from a remote host.  Received packets are filtered against the
//! pattern datakeys instead (see [`crate::remote::selected`]).

use std::fmt;
use std::str::FromStr;

use crate::error::AddressError;
use crate::types::{DataPacket, HostInfo};

pub const WILDCARD: &str = "*";

/// Rendering style of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressStyle {
    /// `<device>:<host>@<addr>::<uuid>[/datakey]`
    Full,
    /// `<uuid>/<device>:<host>@<addr>`, the publisher topic.  The uuid comes
    /// first so that `<uuid>/` selects everything a host publishes.
    Topic,
    /// `<device>`
    Device,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RedvyprAddress {
    pub device: String,
    pub hostname: String,
    pub addr: String,
    pub uuid: String,
    pub datakey: Option<String>,
}

impl RedvyprAddress {
    pub fn new(
        device: impl Into<String>,
        hostname: impl Into<String>,
        addr: impl Into<String>,
        uuid: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            hostname: hostname.into(),
            addr: addr.into(),
            uuid: uuid.into(),
            datakey: None,
        }
    }

    /// The address matching everything.
    pub fn wildcard() -> Self {
        Self::new(WILDCARD, WILDCARD, WILDCARD, WILDCARD)
    }

    pub fn with_datakey(mut self, datakey: impl Into<String>) -> Self {
        self.datakey = Some(datakey.into());
        self
    }

    /// Address of `device` running on `host`.
    pub fn from_host(device: impl Into<String>, host: &HostInfo) -> Self {
        Self::new(device, host.hostname.clone(), host.addr.clone(), host.uuid.clone())
    }

    /// Concrete address of a data packet.
    ///
    /// Fails if the packet lacks a device name or a host uuid, since such a
    /// packet cannot be routed.
    pub fn from_packet(packet: &DataPacket) -> Result<Self, AddressError> {
        let input = format!("{}::{}", packet.device, packet.host.uuid);
        if packet.device.is_empty() {
            return Err(AddressError::EmptyField {
                field: "device",
                input,
            });
        }
        if packet.host.uuid.is_empty() {
            return Err(AddressError::EmptyField {
                field: "uuid",
                input,
            });
        }
        Ok(Self::from_host(packet.device.clone(), &packet.host))
    }

    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AddressError::Empty);
        }
        let separator = |separator| AddressError::Separator {
            separator,
            input: input.to_string(),
        };

        let (left, right) = match input.split_once("::") {
            Some((_, r)) if r.contains("::") => return Err(separator("::")),
            Some((l, r)) => (l, Some(r)),
            None => (input, None),
        };

        let (device, hostpart) = match left.split_once(':') {
            Some((_, h)) if h.contains(':') => return Err(separator(":")),
            Some((d, h)) => (d, Some(h)),
            None if left.contains('@') => return Err(separator("@")),
            None => (left, None),
        };

        let (hostname, addr) = match hostpart.map(|h| h.split_once('@')) {
            Some(Some((_, a))) if a.contains('@') => return Err(separator("@")),
            Some(Some((n, a))) => (Some(n), Some(a)),
            Some(None) => (hostpart, None),
            None => (None, None),
        };

        let (uuid, datakey) = match right.map(|r| r.split_once('/')) {
            Some(Some((u, k))) => (Some(u), Some(k)),
            Some(None) => (right, None),
            None => (None, None),
        };

        let field = |value: Option<&str>, field: &'static str| match value.map(str::trim) {
            None => Ok(WILDCARD.to_string()),
            Some("") => Err(AddressError::EmptyField {
                field,
                input: input.to_string(),
            }),
            Some(v) => Ok(v.to_string()),
        };

        Ok(Self {
            device: field(Some(device), "device")?,
            hostname: field(hostname, "hostname")?,
            addr: field(addr, "addr")?,
            uuid: field(uuid, "uuid")?,
            datakey: datakey.map(|k| field(Some(k), "datakey")).transpose()?,
        })
    }

    /// True if `self` and `other` match field by field.
    pub fn matches(&self, other: &RedvyprAddress) -> bool {
        let datakey = match (&self.datakey, &other.datakey) {
            (Some(a), Some(b)) => field_matches(a, b),
            _ => true,
        };
        datakey
            && field_matches(&self.device, &other.device)
            && field_matches(&self.hostname, &other.hostname)
            && field_matches(&self.addr, &other.addr)
            && field_matches(&self.uuid, &other.uuid)
    }

    /// True if no field is a wildcard.
    pub fn is_concrete(&self) -> bool {
        [&self.device, &self.hostname, &self.addr, &self.uuid]
            .iter()
            .all(|f| f.as_str() != WILDCARD)
    }

    pub fn to_string_style(&self, style: AddressStyle) -> String {
        match style {
            AddressStyle::Full => {
                let mut s = format!(
                    "{}:{}@{}::{}",
                    self.device, self.hostname, self.addr, self.uuid
                );
                if let Some(key) = &self.datakey {
                    s.push('/');
                    s.push_str(key);
                }
                s
            }
            AddressStyle::Topic => {
                format!("{}/{}:{}@{}", self.uuid, self.device, self.hostname, self.addr)
            }
            AddressStyle::Device => self.device.clone(),
        }
    }

    /// Publisher topic of this address.
    pub fn topic(&self) -> String {
        self.to_string_style(AddressStyle::Topic)
    }
}

fn field_matches(a: &str, b: &str) -> bool {
    a == WILDCARD || b == WILDCARD || a == b
}

/// Topic prefix selecting every data packet of a host.
pub fn host_topic(uuid: &str) -> String {
    format!("{}/", uuid)
}

/// Topic carrying status packets of a host.
pub fn status_topic(uuid: &str) -> String {
    format!("{}!", uuid)
}

impl FromStr for RedvyprAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RedvyprAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_style(AddressStyle::Full))
    }
}
