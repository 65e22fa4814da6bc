//! End-to-end tests of two iored hosts on loopback.
//!
//! Multicast is disabled; hosts find each other through explicit queries of
//! the control channel, which is what a received beacon triggers anyway.
//!
//! Run: `cargo test --test routing`

use std::collections::BTreeMap;
use std::time::Duration;

use iored::control;
use iored::{
    Command, Config, ConnectionState, DataPacket, Egress, Iored, IoredError, PortRange,
    RedvyprAddress,
};
use tokio::time::{sleep, timeout, Instant};

fn config(base: u16) -> Config {
    Config {
        multicast_listen: false,
        multicast_send: false,
        multicast_dtbeacon: -1.0,
        bind_ip: Some("127.0.0.1".into()),
        zmq_pub_ports: PortRange::new(base, base + 9),
        zmq_rep_ports: PortRange::new(base + 10, base + 19),
        query_timeout_ms: 1000,
        poll_timeout_ms: 50,
        tick_ms: 20,
        reconcile_interval_ms: 200,
        ..Config::default()
    }
}

/// Reads egress until `pred` matches or `limit` expires.
async fn wait_for<F>(iored: &mut Iored, limit: Duration, mut pred: F) -> Option<Egress>
where
    F: FnMut(&Egress) -> bool,
{
    let deadline = Instant::now() + limit;
    loop {
        match tokio::time::timeout_at(deadline, iored.recv()).await {
            Ok(Some(message)) if pred(&message) => return Some(message),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn query_populates_remote_record() {
    let a = Iored::start(config(29000)).await.unwrap();
    let mut b = Iored::start(config(29000)).await.unwrap();
    assert_ne!(a.host().uuid, b.host().uuid);

    b.send(Command::Query(a.rep_url().to_string())).await.unwrap();
    let uuid_a = a.host().uuid.clone();
    let info = wait_for(&mut b, Duration::from_secs(3), |m| {
        matches!(m, Egress::HostInfo(info) if info.host.uuid == uuid_a)
    })
    .await;
    assert!(info.is_some());

    let records = b.registry().snapshot().await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.uuid, a.host().uuid);
    assert_eq!(record.zmq_pub_url, a.pub_url());
    assert_eq!(record.zmq_rep_url, a.rep_url());
    assert!(!record.connected);
    assert!(!record.is_tombstoned());

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

/// Publishes a `temp` device on `a` and waits until its catalogue is served.
async fn serve_temp(a: &Iored) {
    let temp = RedvyprAddress::from_host("temp", a.host());
    let mut devices = BTreeMap::new();
    devices.insert(temp.to_string(), serde_json::json!({"unit": "degC"}));
    a.send(Command::DeviceinfoAll(devices)).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let info = control::query(a.rep_url(), Duration::from_secs(1)).await;
        if info.is_some_and(|i| i.devices.contains_key(&temp.to_string())) {
            break;
        }
        assert!(Instant::now() < deadline, "catalogue never served");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn subscription_delivers_matching_packets() {
    let mut a = Iored::start(config(29100)).await.unwrap();
    let mut b = Iored::start(config(29100)).await.unwrap();
    serve_temp(&a).await;

    b.send(Command::Subscribe("temp:*".into())).await.unwrap();
    b.send(Command::Query(a.rep_url().to_string())).await.unwrap();

    let mut delivered = None;
    for n in 0..60u64 {
        let mut packet = DataPacket::new(a.host().clone(), "temp").with("T", 20.0);
        packet.numpacket = n;
        let pressure = DataPacket::new(a.host().clone(), "pressure").with("p", 1013.0);
        a.send(Command::Data(packet)).await.unwrap();
        a.send(Command::Data(pressure)).await.unwrap();

        let received = wait_for(&mut b, Duration::from_millis(100), |m| {
            matches!(m, Egress::Packet(_))
        })
        .await;
        if let Some(Egress::Packet(packet)) = received {
            delivered = Some(packet);
            break;
        }
    }
    let packet = delivered.expect("no packet delivered");
    assert_eq!(packet.device, "temp");
    assert_eq!(packet.host.uuid, a.host().uuid);
    assert_eq!(packet.data.get("T"), Some(&serde_json::json!(20.0)));

    let record = b.registry().get(&a.host().uuid).await.unwrap();
    assert!(record.connected);

    // Only subscribed devices are forwarded.
    for _ in 0..5 {
        let pressure = DataPacket::new(a.host().clone(), "pressure").with("p", 1013.0);
        a.send(Command::Data(pressure)).await.unwrap();
    }
    let stray = wait_for(&mut b, Duration::from_millis(300), |m| {
        matches!(m, Egress::Packet(p) if p.device == "pressure")
    })
    .await;
    assert!(stray.is_none());

    // The publisher saw the subscription.
    let host_prefix = format!("{}/", a.host().uuid);
    let seen = wait_for(&mut a, Duration::from_secs(1), |m| {
        matches!(m, Egress::Subscription { subscribe: true, topic } if topic.starts_with(&host_prefix))
    })
    .await;
    assert!(seen.is_some());

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_host_is_tombstoned() {
    let a = Iored::start(config(29200)).await.unwrap();
    let mut b = Iored::start(config(29200)).await.unwrap();
    let uuid_a = a.host().uuid.clone();

    b.send(Command::Subscribe("*".into())).await.unwrap();
    b.send(Command::Query(a.rep_url().to_string())).await.unwrap();
    let connected = wait_for(&mut b, Duration::from_secs(3), |m| {
        matches!(m, Egress::DeviceStatus(s) if s.uuid == uuid_a && s.state == ConnectionState::Connected)
    })
    .await;
    assert!(connected.is_some());

    a.stop().await.unwrap();

    let disconnected = wait_for(&mut b, Duration::from_secs(3), |m| {
        matches!(m, Egress::DeviceStatus(s) if s.uuid == uuid_a && s.state == ConnectionState::Disconnected)
    })
    .await;
    assert!(disconnected.is_some());

    let record = b.registry().get(&uuid_a).await.unwrap();
    assert!(record.tlastseen < 0.0);
    assert!(!record.connected);
    assert_eq!(b.registry().len().await, 1);

    b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn occupied_rep_range_fails_startup_without_leaking() {
    let cfg = config(29300);
    let held: Vec<_> = cfg
        .zmq_rep_ports
        .ports()
        .map(|port| std::net::TcpListener::bind(("0.0.0.0", port)).unwrap())
        .collect();

    let result = Iored::start(cfg.clone()).await;
    assert!(matches!(
        result,
        Err(IoredError::NoFreePort { socket: "rep", .. })
    ));

    // The publisher bound before the failure released its port.  Sockets
    // are closed in the background, so allow a moment.
    let first_pub = cfg.zmq_pub_ports.start;
    let deadline = Instant::now() + Duration::from_secs(1);
    while std::net::TcpListener::bind(("0.0.0.0", first_pub)).is_err() {
        assert!(Instant::now() < deadline, "publisher port still bound");
        sleep(Duration::from_millis(20)).await;
    }
    drop(held);
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_reports_liveness() {
    let a = Iored::start(config(29400)).await.unwrap();
    let mut b = Iored::start(config(29400)).await.unwrap();

    b.send(Command::Ping(a.rep_url().to_string())).await.unwrap();
    let pong = wait_for(&mut b, Duration::from_secs(3), |m| matches!(m, Egress::Pong { .. })).await;
    assert!(matches!(pong, Some(Egress::Pong { alive: true, .. })));

    let gone = a.rep_url().to_string();
    a.stop().await.unwrap();
    b.send(Command::Ping(gone)).await.unwrap();
    let pong = timeout(
        Duration::from_secs(3),
        wait_for(&mut b, Duration::from_secs(3), |m| matches!(m, Egress::Pong { .. })),
    )
    .await
    .unwrap();
    assert!(matches!(pong, Some(Egress::Pong { alive: false, .. })));

    b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribe_withdraws_remote_subscription() {
    let mut a = Iored::start(config(29500)).await.unwrap();
    let b = Iored::start(config(29500)).await.unwrap();
    serve_temp(&a).await;

    b.send(Command::Subscribe("temp:*".into())).await.unwrap();
    b.send(Command::Query(a.rep_url().to_string())).await.unwrap();

    let host_prefix = format!("{}/temp", a.host().uuid);
    let subscribed = wait_for(&mut a, Duration::from_secs(3), |m| {
        matches!(m, Egress::Subscription { subscribe: true, topic } if topic.starts_with(&host_prefix))
    })
    .await;
    let Some(Egress::Subscription { topic, .. }) = subscribed else {
        panic!("subscription never reached the publisher");
    };

    b.send(Command::Unsubscribe("temp:*".into())).await.unwrap();
    let withdrawn = wait_for(&mut a, Duration::from_secs(3), |m| {
        matches!(m, Egress::Subscription { subscribe: false, topic: t } if *t == topic)
    })
    .await;
    assert!(withdrawn.is_some());

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_keeps_remote_closed() {
    let a = Iored::start(config(29600)).await.unwrap();
    let mut b = Iored::start(config(29600)).await.unwrap();
    let uuid_a = a.host().uuid.clone();

    b.send(Command::Subscribe("*".into())).await.unwrap();
    b.send(Command::Query(a.rep_url().to_string())).await.unwrap();
    let connected = wait_for(&mut b, Duration::from_secs(3), |m| {
        matches!(m, Egress::DeviceStatus(s) if s.uuid == uuid_a && s.state == ConnectionState::Connected)
    })
    .await;
    assert!(connected.is_some());

    b.send(Command::Disconnect(uuid_a.clone())).await.unwrap();
    let disconnected = wait_for(&mut b, Duration::from_secs(3), |m| {
        matches!(m, Egress::DeviceStatus(s) if s.uuid == uuid_a && s.state == ConnectionState::Disconnected)
    })
    .await;
    assert!(disconnected.is_some());

    // Several reconcile intervals pass without a reconnect.
    let reconnected = wait_for(&mut b, Duration::from_millis(1000), |m| {
        matches!(m, Egress::DeviceStatus(s) if s.uuid == uuid_a && s.state == ConnectionState::Connected)
    })
    .await;
    assert!(reconnected.is_none());
    let record = b.registry().get(&uuid_a).await.unwrap();
    assert!(!record.connected);
    assert!(!record.is_tombstoned());

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}
