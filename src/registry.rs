//! Table of discovered remote hosts.
//!
//! Records are never removed on their own: a host that announces its stop
//! is tombstoned by negating `tlastseen`, so "known and gone" can be told
//! apart from "never seen".  A host that is merely unreachable only loses its
//! `connected` flag.  Eviction only happens through an
//! explicitly configured [`CompactionPolicy`].

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::address::RedvyprAddress;
use crate::config::CompactionPolicy;
use crate::types::{now, Catalogue, HostInfo, InfoPayload};

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteHostRecord {
    pub uuid: String,
    pub host: HostInfo,
    pub zmq_pub_url: String,
    pub zmq_rep_url: String,
    /// `tinfo` of the last full info fetched, 0 if none yet.
    pub tinfo: f64,
    pub devices: Catalogue,
    pub hostinfo_opt: Map<String, Value>,
    pub connected: bool,
    /// Unix time the host was last seen, negated once tombstoned.
    pub tlastseen: f64,
}

impl RemoteHostRecord {
    fn from_beacon(info: &InfoPayload) -> Self {
        Self {
            uuid: info.host.uuid.clone(),
            host: info.host.clone(),
            zmq_pub_url: info.zmq_pub_url.clone(),
            zmq_rep_url: info.zmq_rep_url.clone(),
            tinfo: 0.0,
            devices: Catalogue::new(),
            hostinfo_opt: Map::new(),
            connected: false,
            tlastseen: now(),
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tlastseen < 0.0
    }

    /// Parsed addresses of the catalogue, skipping entries that do not parse.
    pub fn device_addresses(&self) -> Vec<RedvyprAddress> {
        self.devices
            .keys()
            .filter_map(|key| match RedvyprAddress::parse(key) {
                Ok(addr) => Some(addr),
                Err(e) => {
                    debug!("Ignoring catalogue entry of {}: {}", self.uuid, e);
                    None
                }
            })
            .collect()
    }
}

/// Concurrency-safe registry of remote hosts, keyed by uuid.
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    inner: Arc<RwLock<HashMap<String, RemoteHostRecord>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a presence beacon.
    ///
    /// Returns true if the full info should be fetched: the host is new, was
    /// tombstoned, or announces a newer `tinfo` than the one cached.
    pub async fn observe_beacon(&self, info: &InfoPayload) -> bool {
        let mut map = self.inner.write().await;
        match map.get_mut(&info.host.uuid) {
            Some(record) => {
                let revived = record.is_tombstoned();
                record.zmq_pub_url = info.zmq_pub_url.clone();
                record.zmq_rep_url = info.zmq_rep_url.clone();
                record.tlastseen = now();
                revived || info.tinfo > record.tinfo
            }
            None => {
                info!(
                    "Discovered host {} ({}) at {}",
                    info.host.hostname, info.host.uuid, info.zmq_rep_url
                );
                map.insert(info.host.uuid.clone(), RemoteHostRecord::from_beacon(info));
                true
            }
        }
    }

    /// Stores a full info packet.  Returns true if the catalogue changed.
    pub async fn update_info(&self, info: &InfoPayload) -> bool {
        let mut map = self.inner.write().await;
        let record = map
            .entry(info.host.uuid.clone())
            .or_insert_with(|| RemoteHostRecord::from_beacon(info));
        let changed = record.devices != info.devices || record.is_tombstoned();
        record.host = info.host.clone();
        record.zmq_pub_url = info.zmq_pub_url.clone();
        record.zmq_rep_url = info.zmq_rep_url.clone();
        record.tinfo = info.tinfo;
        record.devices = info.devices.clone();
        record.hostinfo_opt = info.hostinfo_opt.clone();
        record.tlastseen = now();
        debug!(
            "Updated info of {}: {} devices",
            record.uuid,
            record.devices.len()
        );
        changed
    }

    /// Marks a host as gone.  Returns false if the uuid is unknown.
    pub async fn tombstone(&self, uuid: &str) -> bool {
        let mut map = self.inner.write().await;
        match map.get_mut(uuid) {
            Some(record) => {
                if !record.is_tombstoned() {
                    info!("Host {} ({}) is gone", record.host.hostname, uuid);
                    record.tlastseen = -now();
                }
                record.connected = false;
                true
            }
            None => false,
        }
    }

    pub async fn set_connected(&self, uuid: &str, connected: bool) {
        let mut map = self.inner.write().await;
        match map.get_mut(uuid) {
            Some(record) => record.connected = connected,
            None => warn!("Connection state change for unknown host {}", uuid),
        }
    }

    pub async fn get(&self, uuid: &str) -> Option<RemoteHostRecord> {
        self.inner.read().await.get(uuid).cloned()
    }

    pub async fn snapshot(&self) -> Vec<RemoteHostRecord> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Evicts tombstones according to `policy`.  Returns how many went.
    pub async fn compact(&self, policy: &CompactionPolicy) -> usize {
        let mut map = self.inner.write().await;
        let before = map.len();
        let t = now();

        if let Some(ttl) = policy.tombstone_ttl_secs {
            map.retain(|_, r| !r.is_tombstoned() || t + r.tlastseen <= ttl);
        }

        let mut tombstones: Vec<(f64, String)> = map
            .values()
            .filter(|r| r.is_tombstoned())
            .map(|r| (-r.tlastseen, r.uuid.clone()))
            .collect();
        if tombstones.len() > policy.max_tombstones {
            tombstones.sort_by(|a, b| a.0.total_cmp(&b.0));
            let excess = tombstones.len() - policy.max_tombstones;
            for (_, uuid) in tombstones.into_iter().take(excess) {
                map.remove(&uuid);
            }
        }

        let removed = before - map.len();
        if removed > 0 {
            info!("Compacted {} tombstoned hosts", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(uuid: &str, tinfo: f64) -> InfoPayload {
        let mut devices = Catalogue::new();
        devices.insert(format!("temp:host@1.2.3.4::{}", uuid), Value::Null);
        InfoPayload {
            host: HostInfo {
                hostname: "host".into(),
                addr: "1.2.3.4".into(),
                uuid: uuid.into(),
                tstart: 1.0,
            },
            zmq_pub_url: "tcp://1.2.3.4:1".into(),
            zmq_rep_url: "tcp://1.2.3.4:2".into(),
            tinfo,
            devices,
            hostinfo_opt: Map::new(),
        }
    }

    #[tokio::test]
    async fn beacon_requests_query_until_info_is_fetched() {
        let registry = HostRegistry::new();
        let full = info("a", 10.0);
        assert!(registry.observe_beacon(&full.short()).await);
        assert!(registry.observe_beacon(&full.short()).await);

        assert!(registry.update_info(&full).await);
        assert!(!registry.observe_beacon(&full.short()).await);
        assert!(registry.observe_beacon(&info("a", 11.0).short()).await);

        let record = registry.get("a").await.unwrap();
        assert!(!record.connected);
        assert_eq!(record.device_addresses().len(), 1);
    }

    #[tokio::test]
    async fn tombstone_keeps_the_record() {
        let registry = HostRegistry::new();
        registry.update_info(&info("a", 10.0)).await;
        registry.set_connected("a", true).await;

        assert!(registry.tombstone("a").await);
        assert!(!registry.tombstone("unknown").await);

        let record = registry.get("a").await.unwrap();
        assert!(record.is_tombstoned());
        assert!(!record.connected);
        assert_eq!(registry.len().await, 1);

        // A tombstoned host that announces itself again is re-queried.
        assert!(registry.observe_beacon(&info("a", 10.0).short()).await);
        assert!(!registry.get("a").await.unwrap().is_tombstoned());
    }

    #[tokio::test]
    async fn compaction_evicts_oldest_tombstones() {
        let registry = HostRegistry::new();
        for uuid in ["a", "b", "c", "live"] {
            registry.update_info(&info(uuid, 1.0)).await;
        }
        for uuid in ["a", "b", "c"] {
            registry.tombstone(uuid).await;
        }
        let policy = CompactionPolicy {
            max_tombstones: 1,
            tombstone_ttl_secs: None,
        };
        assert_eq!(registry.compact(&policy).await, 2);
        assert_eq!(registry.len().await, 2);
        assert!(registry.get("live").await.is_some());

        let policy = CompactionPolicy {
            max_tombstones: 10,
            tombstone_ttl_secs: Some(-1.0),
        };
        assert_eq!(registry.compact(&policy).await, 1);
        assert!(registry.get("live").await.is_some());
    }
}
