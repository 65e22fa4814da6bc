//! Router main loop and the public [`Iored`] handle.
//!
//! The router runs a fixed tick.  Each tick it:
//!
//! 1. drains the multicast socket and sends the beacon if due,
//! 2. drains subscription notifications of the publisher,
//! 3. drains finished queries and the ingress queue, publishing data and
//!    dispatching commands,
//! 4. drains connection status changes and reconciles subscriptions,
//! 5. sleeps for whatever is left of the tick.
//!
//! Nothing in the loop waits on the network: queries run in their own tasks
//! and report back through a queue, and egress messages are dropped with a
//! warning rather than blocking when the consumer falls behind.

use std::collections::HashSet;
use std::time::Instant;

use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::address::{status_topic, AddressStyle, RedvyprAddress};
use crate::beacon::{Beacon, BeaconEvent};
use crate::codec::encode_batch;
use crate::config::Config;
use crate::control::{self, tcp_url, ControlServer};
use crate::error::{IoredError, Result};
use crate::pubsub::Publisher;
use crate::registry::HostRegistry;
use crate::remote::{ConnectionSettings, RemoteConnectionManager, STATUS_STOPPED};
use crate::types::{
    now, Catalogue, Command, ConnectionState, DataPacket, DeviceStatus, Egress, HostInfo,
    InfoPayload,
};

/// Handle to a running iored instance.
pub struct Iored {
    host: HostInfo,
    pub_url: String,
    rep_url: String,
    registry: HostRegistry,
    ingress: mpsc::Sender<Command>,
    egress: mpsc::Receiver<Egress>,
    task: JoinHandle<Result<()>>,
}

impl Iored {
    /// Binds all sockets and starts the router.
    ///
    /// Fails if the configuration is invalid or no port is free in the pub
    /// or rep range; sockets opened up to that point are closed again.
    pub async fn start(config: Config) -> Result<Self> {
        config.validate()?;
        let patterns = config
            .subscribe
            .iter()
            .map(|p| {
                RedvyprAddress::parse(p)
                    .map_err(|e| IoredError::Config(format!("subscribe pattern: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let ip = config.local_ip();
        let host = HostInfo::local(ip.clone());
        info!("Starting iored on {} as {}", ip, host.uuid);

        let publisher = Publisher::bind(config.zmq_pub_ports)?;
        let pub_url = tcp_url(&ip, publisher.port());

        let info = InfoPayload {
            host: host.clone(),
            zmq_pub_url: pub_url.clone(),
            zmq_rep_url: String::new(),
            tinfo: now(),
            devices: Catalogue::new(),
            hostinfo_opt: serde_json::Map::new(),
        };
        let (info_tx, info_rx) = watch::channel(info.clone());
        let control = match ControlServer::bind(config.zmq_rep_ports, info_rx) {
            Ok(control) => control,
            Err(e) => {
                error!("Control server startup failed: {}", e);
                publisher.close();
                return Err(e);
            }
        };
        let rep_url = tcp_url(&ip, control.port());
        let info = InfoPayload {
            zmq_rep_url: rep_url.clone(),
            ..info
        };
        info_tx.send_replace(info.clone());

        let beacon = match Beacon::new(&config, host.clone()) {
            Ok(beacon) => beacon,
            Err(e) => {
                error!("Multicast socket setup failed: {}", e);
                publisher.close();
                return Err(e.into());
            }
        };

        let registry = HostRegistry::new();
        let (ingress, commands) = mpsc::channel(config.queue_size);
        let (egress_tx, egress) = mpsc::channel(config.queue_size);
        let mut manager = RemoteConnectionManager::new(
            host.uuid.clone(),
            registry.clone(),
            ConnectionSettings::from(&config),
            egress_tx.clone(),
        );
        for pattern in patterns {
            manager.add_pattern(pattern);
        }
        let (query_tx, queries) = mpsc::channel(config.queue_size);

        let control_url = tcp_url("127.0.0.1", control.port());
        let control_token = control.token().to_string();
        let control_stop = control.stopper();
        let control_task = control.spawn();

        let router = Router {
            last_reconcile: Instant::now(),
            reconcile_due: true,
            config,
            host: host.clone(),
            info,
            info_tx,
            beacon,
            publisher,
            control_url,
            control_token,
            control_stop,
            control_task,
            manager,
            registry: registry.clone(),
            commands,
            egress: egress_tx,
            query_tx,
            queries,
            pending_queries: HashSet::new(),
        };
        let task = tokio::spawn(router.run());

        Ok(Self {
            host,
            pub_url,
            rep_url,
            registry,
            ingress,
            egress,
            task,
        })
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    pub fn pub_url(&self) -> &str {
        &self.pub_url
    }

    pub fn rep_url(&self) -> &str {
        &self.rep_url
    }

    /// Read access to the remote host table.
    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// A sender for the ingress queue, for device wrappers.
    pub fn ingress(&self) -> mpsc::Sender<Command> {
        self.ingress.clone()
    }

    pub async fn send(&self, command: Command) -> Result<()> {
        self.ingress
            .send(command)
            .await
            .map_err(|_| IoredError::NotRunning)
    }

    /// Next message from the egress queue.
    pub async fn recv(&mut self) -> Option<Egress> {
        self.egress.recv().await
    }

    /// Stops the router and waits for the teardown to finish.
    pub async fn stop(self) -> Result<()> {
        // The router may already be gone; joining reports why.
        let _ = self.ingress.send(Command::Stop).await;
        self.join().await
    }

    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(IoredError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e,
            ))),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Router {
    config: Config,
    host: HostInfo,
    info: InfoPayload,
    info_tx: watch::Sender<InfoPayload>,
    beacon: Beacon,
    publisher: Publisher,
    control_url: String,
    control_token: String,
    control_stop: CancellationToken,
    control_task: JoinHandle<()>,
    manager: RemoteConnectionManager,
    registry: HostRegistry,
    commands: mpsc::Receiver<Command>,
    egress: mpsc::Sender<Egress>,
    query_tx: mpsc::Sender<(String, Option<InfoPayload>)>,
    queries: mpsc::Receiver<(String, Option<InfoPayload>)>,
    pending_queries: HashSet<String>,
    last_reconcile: Instant,
    reconcile_due: bool,
}

impl Router {
    async fn run(mut self) -> Result<()> {
        let tick = self.config.tick();
        loop {
            let started = Instant::now();
            self.multicast().await;
            self.drain_subscriptions();
            self.drain_queries().await;
            if self.drain_commands().await == Flow::Stop {
                break;
            }
            self.drain_status();
            self.maintain().await;
            sleep(tick.saturating_sub(started.elapsed())).await;
        }
        self.teardown().await;
        Ok(())
    }

    fn emit(&self, message: Egress) {
        if let Err(e) = self.egress.try_send(message) {
            warn!("Egress queue unavailable, dropping message: {}", e);
        }
    }

    async fn multicast(&mut self) {
        for datagram in self.beacon.drain() {
            match self.beacon.process(&datagram, &self.registry).await {
                Some(BeaconEvent::Query { uuid, rep_url }) => {
                    debug!("Querying {} at {}", uuid, rep_url);
                    self.spawn_query(rep_url);
                }
                Some(BeaconEvent::Stopped { uuid }) => {
                    if self.manager.is_connected(&uuid) {
                        self.manager.close(&uuid).await;
                    }
                    self.reconcile_due = true;
                }
                None => {}
            }
        }
        self.beacon.poll_send(&self.info);
    }

    fn drain_subscriptions(&mut self) {
        for event in self.publisher.poll_subscriptions(self.config.queue_size) {
            let topic = String::from_utf8_lossy(&event.topic).into_owned();
            info!(
                "Remote host {} {}",
                if event.subscribe { "subscribed" } else { "unsubscribed" },
                topic
            );
            self.emit(Egress::Subscription {
                subscribe: event.subscribe,
                topic,
            });
        }
    }

    fn spawn_query(&mut self, url: String) {
        if !self.pending_queries.insert(url.clone()) {
            return;
        }
        let tx = self.query_tx.clone();
        let limit = self.config.query_timeout();
        tokio::spawn(async move {
            let info = control::query(&url, limit).await;
            let _ = tx.send((url, info)).await;
        });
    }

    async fn drain_queries(&mut self) {
        while let Ok((url, info)) = self.queries.try_recv() {
            self.pending_queries.remove(&url);
            let Some(info) = info else {
                info!("Host at {} is currently unreachable", url);
                continue;
            };
            if info.host.uuid == self.host.uuid {
                continue;
            }
            let known = self
                .registry
                .get(&info.host.uuid)
                .await
                .is_some_and(|r| r.tinfo > 0.0 && !r.is_tombstoned());
            if self.registry.update_info(&info).await {
                self.reconcile_due = true;
            }
            if !known {
                self.emit(Egress::DeviceStatus(DeviceStatus {
                    uuid: info.host.uuid.clone(),
                    state: ConnectionState::Known,
                }));
            }
            self.emit(Egress::HostInfo(info));
        }
    }

    async fn drain_commands(&mut self) -> Flow {
        let mut batches: Vec<(String, Vec<DataPacket>)> = Vec::new();
        let mut flow = Flow::Continue;
        for _ in 0..self.config.queue_size {
            let command = match self.commands.try_recv() {
                Ok(command) => command,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    info!("Ingress queue closed");
                    flow = Flow::Stop;
                    break;
                }
            };
            match command {
                Command::Data(packet) => self.queue_packet(packet, &mut batches),
                Command::Stop => {
                    info!("Stop requested");
                    flow = Flow::Stop;
                    break;
                }
                other => self.dispatch(other).await,
            }
        }
        self.publish(batches);
        flow
    }

    fn queue_packet(&mut self, packet: DataPacket, batches: &mut Vec<(String, Vec<DataPacket>)>) {
        let address = match RedvyprAddress::from_packet(&packet) {
            Ok(address) => address,
            Err(e) => {
                error!("Dropping unroutable packet: {}", e);
                return;
            }
        };
        if packet.host.uuid == self.host.uuid {
            let key = address.to_string_style(AddressStyle::Full);
            if !self.info.devices.contains_key(&key) {
                info!("New local device {}", key);
                self.info.devices.insert(key, Value::Null);
                self.info_changed();
            }
        }
        let topic = address.topic();
        if let Some((last, packets)) = batches.last_mut() {
            if *last == topic {
                packets.push(packet);
                return;
            }
        }
        batches.push((topic, vec![packet]));
    }

    fn publish(&self, batches: Vec<(String, Vec<DataPacket>)>) {
        for (topic, packets) in batches {
            let t = packets.last().map(|p| p.t).unwrap_or_else(now);
            match encode_batch(&packets) {
                Ok(payload) => {
                    if let Err(e) = self.publisher.publish(topic.as_bytes(), t, &payload) {
                        error!("Failed to publish packets of {}: {}", topic, e);
                    }
                }
                Err(e) => error!("Failed to serialize packets of {}: {}", topic, e),
            }
        }
    }

    async fn dispatch(&mut self, command: Command) {
        match command {
            Command::Subscribe(pattern) => match RedvyprAddress::parse(&pattern) {
                Ok(address) => {
                    if self.manager.add_pattern(address) {
                        info!("Subscribed to {}", pattern);
                        self.reconcile_due = true;
                    }
                }
                Err(e) => error!("Invalid subscription {}: {}", pattern, e),
            },
            Command::Unsubscribe(pattern) => match RedvyprAddress::parse(&pattern) {
                Ok(address) => {
                    if self.manager.remove_pattern(&address) {
                        info!("Unsubscribed from {}", pattern);
                        self.reconcile_due = true;
                    }
                }
                Err(e) => error!("Invalid subscription {}: {}", pattern, e),
            },
            Command::Connect(uuid) => {
                if self.manager.connect(&uuid).await {
                    self.reconcile_due = true;
                }
            }
            Command::Disconnect(uuid) => {
                self.manager.disconnect(&uuid).await;
            }
            Command::Query(url) => self.spawn_query(url),
            Command::Ping(url) => {
                let egress = self.egress.clone();
                let limit = self.config.query_timeout();
                tokio::spawn(async move {
                    let alive = control::ping(&url, limit).await;
                    let _ = egress.send(Egress::Pong { url, alive }).await;
                });
            }
            Command::HostinfoOpt(opt) => {
                self.info.hostinfo_opt = opt;
                self.info_changed();
            }
            Command::DeviceinfoAll(devices) => {
                self.info.devices = devices;
                self.info_changed();
            }
            Command::GetInfo => self.beacon.send_getinfo(),
            Command::Data(_) | Command::Stop => {}
        }
    }

    /// Publishes a new `tinfo` and announces it.
    fn info_changed(&mut self) {
        self.info.tinfo = now();
        self.info_tx.send_replace(self.info.clone());
        self.beacon.request_send();
    }

    fn drain_status(&mut self) {
        for status in self.manager.poll_status() {
            debug!("Host {} is {:?}", status.uuid, status.state);
            self.emit(Egress::DeviceStatus(status));
        }
    }

    async fn maintain(&mut self) {
        if !self.reconcile_due && self.last_reconcile.elapsed() < self.config.reconcile_interval() {
            return;
        }
        self.manager.reconcile().await;
        if let Some(policy) = &self.config.compaction {
            self.registry.compact(policy).await;
        }
        self.reconcile_due = false;
        self.last_reconcile = Instant::now();
    }

    async fn teardown(mut self) {
        info!("Shutting down iored");
        self.beacon.send_stop();
        let status = status_topic(&self.host.uuid);
        if let Err(e) = self.publisher.publish(status.as_bytes(), now(), STATUS_STOPPED) {
            warn!("Failed to publish stop status: {}", e);
        }

        let limit = self.config.query_timeout();
        if !control::teardown(&self.control_url, &self.control_token, limit).await {
            self.control_stop.cancel();
        }
        match timeout(limit, &mut self.control_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Control server task failed: {}", e),
            Err(_) => warn!("Control server did not stop in time"),
        }

        self.manager.shutdown().await;
        let egress = self.egress.clone();
        self.publisher.close();
        if egress.try_send(Egress::Stopped).is_err() {
            debug!("Nobody left to notify about the shutdown");
        }
        info!("iored stopped");
    }
}
