//! Connections to remote hosts.
//!
//! Every connected remote host gets its own task owning a [`Subscriber`] on
//! the remote publisher.  The task is driven through a private command queue
//! and reports state changes on a shared status queue; its lifetime is the
//! [`ConnectionHandle`] held by the [`RemoteConnectionManager`].
//!
//! The manager also owns the local subscription patterns.  [`reconcile`]
//! compares the prefixes each remote should deliver (catalogue devices
//! matching a pattern) with the prefixes already requested and only sends
//! the difference.  A connection that failed is simply started again by the
//! next reconciliation; one closed by [`disconnect`] stays closed until
//! [`connect`] is called or a new pattern is added.
//!
//! [`reconcile`]: RemoteConnectionManager::reconcile
//! [`disconnect`]: RemoteConnectionManager::disconnect
//! [`connect`]: RemoteConnectionManager::connect

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::address::{host_topic, status_topic, RedvyprAddress, WILDCARD};
use crate::codec::decode_batch;
use crate::config::Config;
use crate::control;
use crate::error::IoredError;
use crate::pubsub::{DataMessage, Subscriber};
use crate::registry::{HostRegistry, RemoteHostRecord};
use crate::types::{ConnectionState, DataPacket, DeviceStatus, Egress};

/// Payload of the status message a host publishes when it shuts down.
pub const STATUS_STOPPED: &[u8] = b"stopped";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    Subscribe(String),
    Unsubscribe(String),
    Stop,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub query_timeout: Duration,
    pub poll_timeout: Duration,
    pub max_recv_errors: u32,
    pub queue_size: usize,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            query_timeout: config.query_timeout(),
            poll_timeout: config.poll_timeout(),
            max_recv_errors: config.max_recv_errors.max(1),
            queue_size: config.queue_size,
        }
    }
}

#[derive(Debug)]
struct ConnectionStatus {
    id: u64,
    uuid: String,
    state: ConnectionState,
}

pub struct ConnectionHandle {
    id: u64,
    commands: mpsc::Sender<ConnectionCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    fn stop(&self) {
        if self.commands.try_send(ConnectionCommand::Stop).is_err() {
            self.cancel.cancel();
        }
    }
}

/// Prefixes a remote host must deliver for the given local patterns.
///
/// A pattern with a wildcard device that matches the host selects the whole
/// host with a single `<uuid>/` prefix; otherwise every catalogue device
/// matching a pattern is selected by its own topic.
pub fn desired_prefixes(patterns: &[RedvyprAddress], record: &RemoteHostRecord) -> BTreeSet<String> {
    let mut prefixes = BTreeSet::new();
    if record.is_tombstoned() {
        return prefixes;
    }
    let host = RedvyprAddress::from_host(WILDCARD, &record.host);
    if patterns
        .iter()
        .any(|p| p.device == WILDCARD && p.datakey.is_none() && p.matches(&host))
    {
        prefixes.insert(host_topic(&record.uuid));
        return prefixes;
    }
    for device in record.device_addresses() {
        if patterns.iter().any(|p| p.matches(&device)) {
            prefixes.insert(device.topic());
        }
    }
    prefixes
}

/// Whether a received packet is selected by a local pattern.
///
/// Subscriptions work on device topics, so a pattern datakey is applied
/// here: the packet must carry that key.
pub fn selected(patterns: &[RedvyprAddress], address: &RedvyprAddress, packet: &DataPacket) -> bool {
    patterns.iter().any(|p| {
        p.matches(address)
            && match p.datakey.as_deref() {
                None | Some(WILDCARD) => true,
                Some(key) => packet.data.contains_key(key),
            }
    })
}

pub struct RemoteConnectionManager {
    local_uuid: String,
    registry: HostRegistry,
    settings: ConnectionSettings,
    egress: mpsc::Sender<Egress>,
    connections: HashMap<String, ConnectionHandle>,
    closing: Vec<ConnectionHandle>,
    patterns: Vec<RedvyprAddress>,
    patterns_tx: watch::Sender<Vec<RedvyprAddress>>,
    subscribed: HashMap<String, BTreeSet<String>>,
    /// Hosts disconnected on request, skipped by reconciliation.
    held: HashSet<String>,
    status_tx: mpsc::Sender<ConnectionStatus>,
    status_rx: mpsc::Receiver<ConnectionStatus>,
    next_id: u64,
}

impl RemoteConnectionManager {
    pub fn new(
        local_uuid: impl Into<String>,
        registry: HostRegistry,
        settings: ConnectionSettings,
        egress: mpsc::Sender<Egress>,
    ) -> Self {
        let (status_tx, status_rx) = mpsc::channel(settings.queue_size.max(1));
        let (patterns_tx, _) = watch::channel(Vec::new());
        Self {
            local_uuid: local_uuid.into(),
            registry,
            settings,
            egress,
            connections: HashMap::new(),
            closing: Vec::new(),
            patterns: Vec::new(),
            patterns_tx,
            subscribed: HashMap::new(),
            held: HashSet::new(),
            status_tx,
            status_rx,
            next_id: 0,
        }
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    pub fn is_connected(&self, uuid: &str) -> bool {
        self.connections.get(uuid).is_some_and(ConnectionHandle::is_alive)
    }

    /// Prefixes requested from `uuid` so far.
    pub fn subscriptions(&self, uuid: &str) -> BTreeSet<String> {
        self.subscribed.get(uuid).cloned().unwrap_or_default()
    }

    /// Starts a connection task unless a live one exists, lifting a
    /// previous [`disconnect`](Self::disconnect).
    ///
    /// Returns false if the host is unknown or tombstoned.
    pub async fn connect(&mut self, uuid: &str) -> bool {
        self.held.remove(uuid);
        self.start(uuid).await
    }

    async fn start(&mut self, uuid: &str) -> bool {
        if self.is_connected(uuid) {
            debug!("Already connected to {}", uuid);
            return true;
        }
        let Some(record) = self.registry.get(uuid).await else {
            warn!("Cannot connect to unknown host {}", uuid);
            return false;
        };
        if record.is_tombstoned() {
            info!("Not connecting to {}: host is gone", uuid);
            return false;
        }

        if let Some(old) = self.connections.remove(uuid) {
            self.closing.push(old);
        }
        self.subscribed.remove(uuid);

        self.next_id += 1;
        let (commands, rx) = mpsc::channel(self.settings.queue_size.max(1));
        let cancel = CancellationToken::new();
        let connection = Connection {
            id: self.next_id,
            uuid: uuid.to_string(),
            rep_url: record.zmq_rep_url,
            pub_url: record.zmq_pub_url,
            settings: self.settings,
            registry: self.registry.clone(),
            patterns: self.patterns_tx.subscribe(),
            commands: rx,
            cancel: cancel.clone(),
            status: self.status_tx.clone(),
            egress: self.egress.clone(),
        };
        info!("Connecting to {} ({})", record.host.hostname, uuid);
        let task = tokio::spawn(connection.run());
        self.connections.insert(
            uuid.to_string(),
            ConnectionHandle {
                id: self.next_id,
                commands,
                cancel,
                task,
            },
        );
        true
    }

    /// Stops the connection to `uuid` and keeps it closed.
    pub async fn disconnect(&mut self, uuid: &str) -> bool {
        self.held.insert(uuid.to_string());
        self.close(uuid).await
    }

    /// Stops the connection to `uuid`.  Reconciliation may open it again.
    pub async fn close(&mut self, uuid: &str) -> bool {
        self.subscribed.remove(uuid);
        let Some(handle) = self.connections.remove(uuid) else {
            debug!("Cannot close connection to {}: not connected", uuid);
            return false;
        };
        info!("Disconnecting from {}", uuid);
        handle.stop();
        self.closing.push(handle);
        self.registry.set_connected(uuid, false).await;
        true
    }

    /// Requests `prefix` from a connected remote.
    pub async fn subscribe(&mut self, uuid: &str, prefix: &str) -> bool {
        let sent = self
            .send(uuid, ConnectionCommand::Subscribe(prefix.to_string()))
            .await;
        if sent {
            self.subscribed
                .entry(uuid.to_string())
                .or_default()
                .insert(prefix.to_string());
        }
        sent
    }

    pub async fn unsubscribe(&mut self, uuid: &str, prefix: &str) -> bool {
        if let Some(set) = self.subscribed.get_mut(uuid) {
            set.remove(prefix);
        }
        self.send(uuid, ConnectionCommand::Unsubscribe(prefix.to_string()))
            .await
    }

    async fn send(&self, uuid: &str, command: ConnectionCommand) -> bool {
        let Some(handle) = self.connections.get(uuid) else {
            warn!("Ignoring {:?} for {}: not connected", command, uuid);
            return false;
        };
        handle.commands.send(command).await.is_ok()
    }

    pub fn patterns(&self) -> &[RedvyprAddress] {
        &self.patterns
    }

    /// Adds a local subscription pattern.  Returns false if already present.
    ///
    /// A new pattern lifts every hold left by [`disconnect`](Self::disconnect).
    pub fn add_pattern(&mut self, pattern: RedvyprAddress) -> bool {
        if self.patterns.contains(&pattern) {
            return false;
        }
        self.patterns.push(pattern);
        self.patterns_tx.send_replace(self.patterns.clone());
        self.held.clear();
        true
    }

    pub fn remove_pattern(&mut self, pattern: &RedvyprAddress) -> bool {
        let before = self.patterns.len();
        self.patterns.retain(|p| p != pattern);
        self.patterns_tx.send_replace(self.patterns.clone());
        self.patterns.len() != before
    }

    /// Brings every remote's subscriptions in line with the local patterns.
    pub async fn reconcile(&mut self) {
        for record in self.registry.snapshot().await {
            if record.uuid == self.local_uuid || self.held.contains(&record.uuid) {
                continue;
            }
            let desired = desired_prefixes(&self.patterns, &record);
            let live = self.is_connected(&record.uuid);
            if desired.is_empty() && !live {
                self.subscribed.remove(&record.uuid);
                continue;
            }
            if !desired.is_empty() && !live && !self.start(&record.uuid).await {
                continue;
            }

            let current = self.subscriptions(&record.uuid);
            for prefix in desired.difference(&current) {
                debug!("Subscribing {} from {}", prefix, record.uuid);
                self.subscribe(&record.uuid, prefix).await;
            }
            for prefix in current.difference(&desired) {
                debug!("Unsubscribing {} from {}", prefix, record.uuid);
                self.unsubscribe(&record.uuid, prefix).await;
            }
        }
    }

    /// Drains connection state changes without waiting.
    pub fn poll_status(&mut self) -> Vec<DeviceStatus> {
        let mut changes = Vec::new();
        while let Ok(status) = self.status_rx.try_recv() {
            if status.state == ConnectionState::Disconnected {
                let current = self
                    .connections
                    .get(&status.uuid)
                    .is_some_and(|h| h.id == status.id);
                if current {
                    if let Some(handle) = self.connections.remove(&status.uuid) {
                        self.closing.push(handle);
                    }
                    self.subscribed.remove(&status.uuid);
                }
            }
            changes.push(DeviceStatus {
                uuid: status.uuid,
                state: status.state,
            });
        }
        self.closing.retain(ConnectionHandle::is_alive);
        changes
    }

    /// Stops every connection and waits for the tasks to end.  A task that
    /// does not end in time is aborted.
    pub async fn shutdown(&mut self) {
        let handles: Vec<_> = self
            .connections
            .drain()
            .map(|(_, h)| h)
            .chain(self.closing.drain(..))
            .collect();
        for handle in &handles {
            handle.stop();
            handle.cancel.cancel();
        }
        let limit = self.settings.poll_timeout + self.settings.query_timeout;
        for mut handle in handles {
            match timeout(limit, &mut handle.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Connection task failed: {}", e),
                Err(_) => {
                    warn!("Connection task did not stop in time, aborting it");
                    handle.task.abort();
                }
            }
        }
        self.subscribed.clear();
    }
}

enum Ending {
    /// Stopped locally or the local side went away.
    Requested,
    /// The remote host announced its shutdown.
    RemoteStopped,
    Failed,
}

struct Connection {
    id: u64,
    uuid: String,
    rep_url: String,
    pub_url: String,
    settings: ConnectionSettings,
    registry: HostRegistry,
    patterns: watch::Receiver<Vec<RedvyprAddress>>,
    commands: mpsc::Receiver<ConnectionCommand>,
    cancel: CancellationToken,
    status: mpsc::Sender<ConnectionStatus>,
    egress: mpsc::Sender<Egress>,
}

impl Connection {
    async fn report(&self, state: ConnectionState) {
        let status = ConnectionStatus {
            id: self.id,
            uuid: self.uuid.clone(),
            state,
        };
        if self.status.send(status).await.is_err() {
            debug!("Status queue closed");
        }
    }

    async fn run(mut self) {
        self.report(ConnectionState::Connecting).await;
        match self.open().await {
            Ok(subscriber) => {
                self.registry.set_connected(&self.uuid, true).await;
                self.report(ConnectionState::Connected).await;
                match self.serve(subscriber).await {
                    Ending::Requested | Ending::Failed => {
                        self.registry.set_connected(&self.uuid, false).await
                    }
                    Ending::RemoteStopped => {
                        self.registry.tombstone(&self.uuid).await;
                    }
                }
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", self.uuid, e);
                self.registry.set_connected(&self.uuid, false).await;
            }
        }
        self.report(ConnectionState::Disconnected).await;
        debug!("Connection task for {} ended", self.uuid);
    }

    async fn open(&mut self) -> Result<Subscriber, IoredError> {
        match control::query(&self.rep_url, self.settings.query_timeout).await {
            Some(info) => {
                self.pub_url = info.zmq_pub_url.clone();
                self.registry.update_info(&info).await;
            }
            None => {
                return Err(IoredError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    format!("no info from {}", self.rep_url),
                )))
            }
        }
        let subscriber = Subscriber::connect(&self.pub_url)?;
        subscriber.subscribe(status_topic(&self.uuid).as_bytes())?;
        Ok(subscriber)
    }

    async fn serve(&mut self, mut subscriber: Subscriber) -> Ending {
        let status = status_topic(&self.uuid);
        let mut errors = 0;
        loop {
            if !self.apply_commands(&subscriber) {
                return Ending::Requested;
            }
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return Ending::Requested,
                received = subscriber.recv(self.settings.poll_timeout) => received,
            };
            match received {
                Ok(None) => {}
                Ok(Some(message)) => {
                    errors = 0;
                    if message.topic == status.as_bytes() {
                        if message.payload == STATUS_STOPPED {
                            info!("Host {} stopped publishing", self.uuid);
                            return Ending::RemoteStopped;
                        }
                        continue;
                    }
                    if !self.forward(message).await {
                        return Ending::Requested;
                    }
                }
                Err(IoredError::Decode(e)) => warn!("Malformed message from {}: {}", self.uuid, e),
                Err(e) => {
                    errors += 1;
                    debug!("Receive error {} from {}: {}", errors, self.uuid, e);
                    if errors >= self.settings.max_recv_errors {
                        warn!("Giving up connection to {} after {} errors", self.uuid, errors);
                        return Ending::Failed;
                    }
                }
            }
        }
    }

    /// Applies queued commands.  Returns false once the connection must end.
    fn apply_commands(&mut self, subscriber: &Subscriber) -> bool {
        loop {
            let command = match self.commands.try_recv() {
                Ok(command) => command,
                Err(mpsc::error::TryRecvError::Empty) => return !self.cancel.is_cancelled(),
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            };
            let result = match &command {
                ConnectionCommand::Subscribe(prefix) => subscriber.subscribe(prefix.as_bytes()),
                ConnectionCommand::Unsubscribe(prefix) => subscriber.unsubscribe(prefix.as_bytes()),
                ConnectionCommand::Stop => return false,
            };
            if let Err(e) = result {
                warn!("{:?} on {} failed: {}", command, self.uuid, e);
            }
        }
    }

    /// Decodes a batch and hands every routable, selected packet to the
    /// egress queue in order.  Returns false once the connection must end.
    async fn forward(&self, message: DataMessage) -> bool {
        let patterns = self.patterns.borrow().clone();
        for packet in decode_batch(&message.payload) {
            let packet = match packet {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Dropping undecodable packet from {}: {}", self.uuid, e);
                    continue;
                }
            };
            let address = match RedvyprAddress::from_packet(&packet) {
                Ok(address) => address,
                Err(e) => {
                    error!("Dropping unroutable packet from {}: {}", self.uuid, e);
                    continue;
                }
            };
            if !selected(&patterns, &address, &packet) {
                debug!("Skipping {} from {}: not subscribed", address, self.uuid);
                continue;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                sent = self.egress.send(Egress::Packet(packet)) => {
                    if sent.is_err() {
                        debug!("Egress queue closed");
                        return false;
                    }
                }
            }
        }
        true
    }
}
