use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use crate::error::IoredError;

/// Inclusive TCP port range tried sequentially when binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn ports(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }
}

/// Opt-in eviction of tombstoned remote host records.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct CompactionPolicy {
    /// Keep at most this many tombstones, evicting the oldest first.
    pub max_tombstones: usize,
    /// Evict tombstones older than this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tombstone_ttl_secs: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub multicast_address: Ipv4Addr,
    pub multicast_port: u16,
    pub multicast_listen: bool,
    pub multicast_send: bool,
    /// Beacon interval in seconds; non-positive disables the periodic beacon.
    pub multicast_dtbeacon: f64,
    /// Address advertised in urls and host info; autodetected if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    pub zmq_pub_ports: PortRange,
    pub zmq_rep_ports: PortRange,
    pub query_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub tick_ms: u64,
    pub reconcile_interval_ms: u64,
    pub max_recv_errors: u32,
    pub queue_size: usize,
    /// Address patterns subscribed at start.
    pub subscribe: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction: Option<CompactionPolicy>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multicast_address: Ipv4Addr::new(239, 255, 255, 239),
            multicast_port: 18196,
            multicast_listen: true,
            multicast_send: true,
            multicast_dtbeacon: 60.0,
            bind_ip: None,
            zmq_pub_ports: PortRange::new(18196, 18295),
            zmq_rep_ports: PortRange::new(18296, 18395),
            query_timeout_ms: 2000,
            poll_timeout_ms: 100,
            tick_ms: 50,
            reconcile_interval_ms: 2000,
            max_recv_errors: 3,
            queue_size: 1024,
            subscribe: Vec::new(),
            compaction: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Loads `iored.toml` and `iored.json` from `dir`, then `IORED_*`
    /// environment variables, on top of the defaults.
    pub fn load_from(dir: &Path) -> anyhow::Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(dir.join("iored.toml")))
            .merge(Json::file(dir.join("iored.json")))
            .merge(Env::prefixed("IORED_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IoredError> {
        for (name, range) in [("pub", self.zmq_pub_ports), ("rep", self.zmq_rep_ports)] {
            if range.start > range.end || range.start == 0 {
                return Err(IoredError::Config(format!(
                    "empty {} port range {}-{}",
                    name, range.start, range.end
                )));
            }
        }
        if self.tick_ms == 0 || self.poll_timeout_ms == 0 || self.query_timeout_ms == 0 {
            return Err(IoredError::Config("tick and timeouts must be positive".into()));
        }
        if self.queue_size == 0 {
            return Err(IoredError::Config("queue_size must be positive".into()));
        }
        if let Some(ip) = &self.bind_ip {
            ip.parse::<IpAddr>()
                .map_err(|e| IoredError::Config(format!("invalid bind_ip {}: {}", ip, e)))?;
        }
        Ok(())
    }

    /// Address other hosts reach us at.
    ///
    /// Falls back to the interface routing towards the multicast group, and
    /// to loopback if there is none.
    pub fn local_ip(&self) -> String {
        if let Some(ip) = &self.bind_ip {
            return ip.clone();
        }
        UdpSocket::bind("0.0.0.0:0")
            .and_then(|s| {
                s.connect((self.multicast_address, self.multicast_port))?;
                s.local_addr()
            })
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|_| Ipv4Addr::LOCALHOST.to_string())
    }

    pub fn beacon_interval(&self) -> Option<Duration> {
        (self.multicast_dtbeacon > 0.0).then(|| Duration::from_secs_f64(self.multicast_dtbeacon))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}
