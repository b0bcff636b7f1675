use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use hubmesh_broker::InMemoryBroker;
use hubmesh_core::delivery::LocalDelivery;
use hubmesh_core::hub::Hub;
use hubmesh_core::ids::ConnectionId;
use hubmesh_engine::{Backplane, LazyHubRegistry};
use hubmesh_server::{ClientConnection, ConnectionManager};
use hubmesh_settings::{HubmeshSettings, LogLevel};
use hubmesh_telemetry::{init_telemetry, MetricsRecorder, TelemetryConfig};

/// Run several in-process nodes on one broker and broadcast across them.
#[derive(Parser, Debug)]
#[command(name = "hubmesh", version)]
struct Args {
    /// Number of nodes to start.
    #[arg(long, default_value_t = 2)]
    nodes: usize,

    /// Settings file (defaults to ~/.hubmesh/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Message broadcast from the first node.
    #[arg(long, default_value = "hello from node 0")]
    message: String,

    /// Raise a module to debug after startup (repeatable), e.g. hubmesh_broker.
    #[arg(long = "debug", value_name = "MODULE")]
    debug_modules: Vec<String>,
}

struct ChatHub;

impl Hub for ChatHub {
    const NAME: &'static str = "chat";
}

struct DemoNode {
    backplane: Backplane,
    client: ConnectionId,
    inbox: mpsc::Receiver<Arc<String>>,
}

fn to_level(level: LogLevel) -> Level {
    level.as_filter_str().parse().unwrap_or(Level::INFO)
}

fn load(args: &Args) -> anyhow::Result<HubmeshSettings> {
    let settings = match &args.settings {
        Some(path) => hubmesh_settings::load_settings_from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => hubmesh_settings::load_settings().context("loading settings")?,
    };
    Ok(settings)
}

async fn start_node(
    index: usize,
    settings: &HubmeshSettings,
    broker: &InMemoryBroker,
    metrics: &Arc<MetricsRecorder>,
    cancel: &CancellationToken,
) -> anyhow::Result<DemoNode> {
    let manager = Arc::new(ConnectionManager::for_hub::<ChatHub>());
    let registry = LazyHubRegistry::new();
    let shared = manager.clone();
    registry.register::<ChatHub, _>(move || shared.clone() as Arc<dyn LocalDelivery>);

    let backplane = Backplane::new(
        settings.backplane.clone(),
        Arc::new(broker.clone()),
        Arc::new(registry),
        metrics.clone(),
    );
    backplane
        .start(cancel)
        .await
        .with_context(|| format!("starting node {index}"))?;

    let (tx, inbox) = mpsc::channel(64);
    let client = ConnectionId::new();
    manager
        .on_connected(Arc::new(ClientConnection::new(client.clone(), None, tx)))
        .await;

    Ok(DemoNode {
        backplane,
        client,
        inbox,
    })
}

async fn broadcast(
    nodes: &mut [DemoNode],
    message: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let Some(first) = nodes.first() else {
        return Ok(());
    };
    first
        .backplane
        .publisher::<ChatHub>()?
        .send_all("ReceiveMessage", vec![json!(message)], cancel)
        .await?;

    for (index, node) in nodes.iter_mut().enumerate() {
        match tokio::time::timeout(Duration::from_secs(2), node.inbox.recv()).await {
            Ok(Some(frame)) => println!(
                "node {index} ({}) client {} received {frame}",
                node.backplane.node_id(),
                node.client
            ),
            _ => println!(
                "node {index} ({}) client {} received nothing",
                node.backplane.node_id(),
                node.client
            ),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.nodes == 0 {
        bail!("--nodes must be at least 1");
    }

    let settings = load(&args)?;
    let telemetry = init_telemetry(TelemetryConfig {
        log_level: to_level(settings.logging.level),
        module_levels: settings
            .logging
            .modules
            .iter()
            .map(|(module, level)| (module.clone(), to_level(*level)))
            .collect(),
        json: settings.logging.json,
        ..TelemetryConfig::default()
    });
    for module in &args.debug_modules {
        if !telemetry.set_module_level(module, Level::DEBUG) {
            warn!(%module, "could not raise log level");
        }
    }
    let metrics = telemetry
        .metrics()
        .unwrap_or_else(|| Arc::new(MetricsRecorder::new()));

    let broker = InMemoryBroker::connect(&settings.backplane.connection_string)
        .context("connecting to broker")?;
    info!(nodes = args.nodes, topic = %settings.backplane.topic_name, "starting hubmesh demo");

    let cancel = CancellationToken::new();
    let mut nodes = Vec::with_capacity(args.nodes);
    let outcome = tokio::select! {
        r = async {
            for index in 0..args.nodes {
                nodes.push(start_node(index, &settings, &broker, &metrics, &cancel).await?);
            }
            broadcast(&mut nodes, &args.message, &cancel).await
        } => r,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            cancel.cancel();
            Ok(())
        }
    };

    let shutdown = CancellationToken::new();
    for node in &nodes {
        let report = node.backplane.stop(&shutdown).await;
        if !report.is_clean() {
            warn!(node_id = %node.backplane.node_id(), ?report, "node stopped with errors");
        }
    }
    info!(
        published = metrics.counter_total("backplane_envelopes_published_total"),
        received = metrics.counter_total("backplane_envelopes_received_total"),
        "demo finished"
    );
    outcome
}
