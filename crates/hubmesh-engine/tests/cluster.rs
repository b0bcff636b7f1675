//! Several nodes sharing one in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;

use hubmesh_broker::InMemoryBroker;
use hubmesh_core::delivery::LocalDelivery;
use hubmesh_core::hub::Hub;
use hubmesh_core::ids::ConnectionId;
use hubmesh_core::mock::{DeliveryCall, MemoryRegistry, RecordingDelivery};
use hubmesh_core::recipient::Recipient;
use hubmesh_engine::{Backplane, ClusterPublisher, LazyHubRegistry};
use hubmesh_server::{ClientConnection, ConnectionManager};
use hubmesh_settings::BackplaneSettings;
use hubmesh_telemetry::{CaptureLayer, LogQuery, MemoryLogSink, MetricsRecorder};

struct ChatHub;
impl Hub for ChatHub {
    const NAME: &'static str = "chat";
}

struct NoSuchHub;
impl Hub for NoSuchHub {
    const NAME: &'static str = "NoSuchHub";
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

fn dropped(node: &Backplane, reason: &str) -> u64 {
    node.metrics()
        .counter_get("backplane_envelopes_dropped_total", &[("reason", reason)])
}

// ── Nodes backed by recording delivery ─────────────────────────────────────

fn recording_node(broker: &InMemoryBroker) -> (Backplane, Arc<RecordingDelivery>) {
    let delivery = Arc::new(RecordingDelivery::new());
    let registry = MemoryRegistry::new().with(ChatHub::NAME, delivery.clone());
    let node = Backplane::new(
        BackplaneSettings::default(),
        Arc::new(broker.clone()),
        Arc::new(registry),
        Arc::new(MetricsRecorder::new()),
    );
    (node, delivery)
}

#[tokio::test]
async fn broadcast_reaches_other_node_once() {
    let broker = InMemoryBroker::new();
    let (a, a_delivery) = recording_node(&broker);
    let (b, b_delivery) = recording_node(&broker);
    let cancel = CancellationToken::new();
    a.start(&cancel).await.unwrap();
    b.start(&cancel).await.unwrap();

    a.publisher::<ChatHub>()
        .unwrap()
        .send_all_except("Foo", vec![json!(42), json!("hi")], vec![], &cancel)
        .await
        .unwrap();

    let expected = DeliveryCall::AllExcept {
        method: "Foo".into(),
        args: vec![json!(42), json!("hi")],
        excluded: vec![],
    };
    assert!(eventually(|| b_delivery.call_count() == 1).await);
    assert!(eventually(|| dropped(&a, "self") == 1).await);

    assert_eq!(b_delivery.calls(), vec![expected.clone()]);
    // Node A delivered locally once and ignored its own echo.
    assert_eq!(a_delivery.calls(), vec![expected]);

    assert!(a.stop(&cancel).await.is_clean());
    assert!(b.stop(&cancel).await.is_clean());
    assert_eq!(broker.subscription_count(), 0);
}

#[tokio::test]
async fn group_exclusions_survive_the_wire() {
    let broker = InMemoryBroker::new();
    let (a, _) = recording_node(&broker);
    let (b, b_delivery) = recording_node(&broker);
    let cancel = CancellationToken::new();
    a.start(&cancel).await.unwrap();
    b.start(&cancel).await.unwrap();

    a.publisher::<ChatHub>()
        .unwrap()
        .send_group_except("room1", "Foo", vec![json!(1)], vec!["c1".into()], &cancel)
        .await
        .unwrap();

    assert!(eventually(|| b_delivery.call_count() == 1).await);
    assert_eq!(
        b_delivery.calls(),
        vec![DeliveryCall::GroupExcept {
            group_name: "room1".into(),
            method: "Foo".into(),
            args: vec![json!(1)],
            excluded: vec!["c1".into()],
        }]
    );

    let _ = a.stop(&cancel).await;
    let _ = b.stop(&cancel).await;
}

#[tokio::test]
async fn every_node_but_the_sender_replays() {
    let broker = InMemoryBroker::new();
    let nodes: Vec<_> = (0..4).map(|_| recording_node(&broker)).collect();
    let cancel = CancellationToken::new();
    let started = join_all(nodes.iter().map(|(node, _)| node.start(&cancel))).await;
    assert!(started.iter().all(Result::is_ok));

    nodes[0]
        .0
        .publisher::<ChatHub>()
        .unwrap()
        .send_user("alice", "Ping", vec![], &cancel)
        .await
        .unwrap();

    for (_, delivery) in &nodes[1..] {
        assert!(eventually(|| delivery.call_count() == 1).await);
    }
    assert!(eventually(|| dropped(&nodes[0].0, "self") == 1).await);
    assert_eq!(nodes[0].1.call_count(), 1);

    let reports = join_all(nodes.iter().map(|(node, _)| node.stop(&cancel))).await;
    assert!(reports.iter().all(|r| r.is_clean()));
    assert_eq!(broker.subscription_count(), 0);
}

#[tokio::test]
async fn unknown_hub_warns_once_and_delivers_nothing() {
    let sink = Arc::new(MemoryLogSink::new(100));
    let subscriber = tracing_subscriber::registry().with(CaptureLayer::new(sink.clone()));
    let _default = tracing::subscriber::set_default(subscriber);

    let broker = InMemoryBroker::new();
    let (a, _) = recording_node(&broker);
    let (b, b_delivery) = recording_node(&broker);
    let cancel = CancellationToken::new();
    a.start(&cancel).await.unwrap();
    b.start(&cancel).await.unwrap();

    let publisher: ClusterPublisher<NoSuchHub> = ClusterPublisher::new(
        a.node_id().clone(),
        a.settings().topic_name.clone(),
        Arc::new(broker.clone()),
        Arc::new(RecordingDelivery::new()),
        a.metrics().clone(),
    );
    publisher
        .publish("Foo", vec![], Recipient::all(), &cancel)
        .await
        .unwrap();

    assert!(eventually(|| dropped(&b, "unknown_hub") == 1).await);
    assert!(eventually(|| dropped(&a, "self") == 1).await);
    assert_eq!(b_delivery.call_count(), 0);

    let warnings = sink.query(&LogQuery {
        hub: Some("NoSuchHub".into()),
        ..LogQuery::default()
    });
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].node_id.as_deref(), Some(b.node_id().as_str()));

    let _ = a.stop(&cancel).await;
    let _ = b.stop(&cancel).await;
}

#[tokio::test]
async fn stopped_node_misses_messages_sent_meanwhile() {
    let broker = InMemoryBroker::new();
    let (a, _) = recording_node(&broker);
    let (b, b_delivery) = recording_node(&broker);
    let cancel = CancellationToken::new();
    a.start(&cancel).await.unwrap();
    b.start(&cancel).await.unwrap();
    let publisher = a.publisher::<ChatHub>().unwrap();

    let _ = b.stop(&cancel).await;
    publisher
        .send_group("room1", "WhileAway", vec![], &cancel)
        .await
        .unwrap();

    b.start(&cancel).await.unwrap();
    publisher
        .send_group("room1", "AfterReturn", vec![], &cancel)
        .await
        .unwrap();

    assert!(eventually(|| b_delivery.call_count() == 1).await);
    assert!(matches!(
        &b_delivery.calls()[0],
        DeliveryCall::GroupExcept { method, .. } if method == "AfterReturn"
    ));

    let _ = a.stop(&cancel).await;
    let _ = b.stop(&cancel).await;
}

// ── Nodes backed by real connection managers ───────────────────────────────

struct ChatNode {
    backplane: Backplane,
    manager: Arc<ConnectionManager>,
}

impl ChatNode {
    fn new(broker: &InMemoryBroker) -> Self {
        let manager = Arc::new(ConnectionManager::for_hub::<ChatHub>());
        let registry = LazyHubRegistry::new();
        let shared = manager.clone();
        registry.register::<ChatHub, _>(move || shared.clone() as Arc<dyn LocalDelivery>);
        let backplane = Backplane::new(
            BackplaneSettings::default(),
            Arc::new(broker.clone()),
            Arc::new(registry),
            Arc::new(MetricsRecorder::new()),
        );
        Self { backplane, manager }
    }

    async fn connect(&self, id: &str, user: Option<&str>) -> mpsc::Receiver<Arc<String>> {
        let (tx, rx) = mpsc::channel(16);
        let conn = ClientConnection::new(ConnectionId::from_raw(id), user.map(Into::into), tx);
        self.manager.on_connected(Arc::new(conn)).await;
        rx
    }
}

async fn next_frame(rx: &mut mpsc::Receiver<Arc<String>>) -> Option<Value> {
    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .ok()??;
    serde_json::from_str(&frame).ok()
}

#[tokio::test]
async fn clients_on_every_node_receive_a_broadcast() {
    let broker = InMemoryBroker::new();
    let a = ChatNode::new(&broker);
    let b = ChatNode::new(&broker);
    let cancel = CancellationToken::new();
    a.backplane.start(&cancel).await.unwrap();
    b.backplane.start(&cancel).await.unwrap();

    let mut a1 = a.connect("a1", None).await;
    let mut b1 = b.connect("b1", None).await;
    let mut b2 = b.connect("b2", None).await;

    a.backplane
        .publisher::<ChatHub>()
        .unwrap()
        .send_all("ReceiveMessage", vec![json!("hello")], &cancel)
        .await
        .unwrap();

    for rx in [&mut a1, &mut b1, &mut b2] {
        let frame = next_frame(rx).await.unwrap();
        assert_eq!(frame["target"], "ReceiveMessage");
        assert_eq!(frame["arguments"], json!(["hello"]));
    }

    // The sender's own echo must not produce a second frame.
    assert!(eventually(|| dropped(&a.backplane, "self") == 1).await);
    assert!(a1.try_recv().is_err());

    let _ = a.backplane.stop(&cancel).await;
    let _ = b.backplane.stop(&cancel).await;
}

#[tokio::test]
async fn groups_and_users_span_nodes() {
    let broker = InMemoryBroker::new();
    let a = ChatNode::new(&broker);
    let b = ChatNode::new(&broker);
    let cancel = CancellationToken::new();
    a.backplane.start(&cancel).await.unwrap();
    b.backplane.start(&cancel).await.unwrap();

    let mut a1 = a.connect("a1", Some("alice")).await;
    let mut b1 = b.connect("b1", Some("alice")).await;
    let mut b2 = b.connect("b2", Some("bob")).await;

    let pa = a.backplane.publisher::<ChatHub>().unwrap();
    let pb = b.backplane.publisher::<ChatHub>().unwrap();
    pa.add_to_group("a1", "room1", &cancel).await.unwrap();
    pb.add_to_group("b2", "room1", &cancel).await.unwrap();

    pa.send_group("room1", "RoomMessage", vec![], &cancel)
        .await
        .unwrap();
    assert_eq!(next_frame(&mut a1).await.unwrap()["target"], "RoomMessage");
    assert_eq!(next_frame(&mut b2).await.unwrap()["target"], "RoomMessage");

    pb.send_user("alice", "Direct", vec![], &cancel).await.unwrap();
    assert_eq!(next_frame(&mut b1).await.unwrap()["target"], "Direct");
    assert_eq!(next_frame(&mut a1).await.unwrap()["target"], "Direct");

    // b1 was never in room1 and bob was never addressed directly.
    assert!(b1.try_recv().is_err());
    assert!(b2.try_recv().is_err());

    let _ = a.backplane.stop(&cancel).await;
    let _ = b.backplane.stop(&cancel).await;
}

#[tokio::test]
async fn connection_addressed_on_another_node() {
    let broker = InMemoryBroker::new();
    let a = ChatNode::new(&broker);
    let b = ChatNode::new(&broker);
    let cancel = CancellationToken::new();
    a.backplane.start(&cancel).await.unwrap();
    b.backplane.start(&cancel).await.unwrap();

    let mut b1 = b.connect("b1", None).await;

    // Node A has no "b1"; local delivery is a no-op and node B delivers.
    a.backplane
        .publisher::<ChatHub>()
        .unwrap()
        .send_connection("b1", "Whisper", vec![json!("psst")], &cancel)
        .await
        .unwrap();

    let frame = next_frame(&mut b1).await.unwrap();
    assert_eq!(frame["target"], "Whisper");
    assert_eq!(frame["arguments"], json!(["psst"]));

    let _ = a.backplane.stop(&cancel).await;
    let _ = b.backplane.stop(&cancel).await;
}
