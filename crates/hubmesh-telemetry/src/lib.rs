mod logging;
mod metrics;

pub use logging::{CaptureLayer, LogQuery, LogRecord, MemoryLogSink};
pub use metrics::{HistogramSummary, MetricType, MetricsQuery, MetricsRecorder, MetricsSnapshot};

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "hubmesh_broker" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout when true, human-readable otherwise.
    pub json: bool,
    /// Keep the most recent warn+ events in memory.
    pub capture_warnings: bool,
    pub capture_capacity: usize,
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            capture_warnings: true,
            capture_capacity: 1000,
            metrics_enabled: true,
        }
    }
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Handle to the installed telemetry subsystem.
pub struct TelemetryGuard {
    log_sink: Option<Arc<MemoryLogSink>>,
    metrics_recorder: Option<Arc<MetricsRecorder>>,
    filter: FilterHandle,
    base_level: Level,
    module_levels: Mutex<Vec<(String, Level)>>,
}

impl TelemetryGuard {
    /// Change one module's level on the live subscriber.
    ///
    /// Returns false when the filter could not be swapped, which happens when
    /// another subscriber was already installed. The override is still
    /// remembered and applied by the next successful change.
    pub fn set_module_level(&self, module: &str, level: Level) -> bool {
        let mut levels = self.module_levels.lock();
        match levels.iter_mut().find(|(m, _)| m == module) {
            Some(entry) => entry.1 = level,
            None => levels.push((module.to_string(), level)),
        }

        let directives = filter_directives(self.base_level, &levels);
        match self.filter.reload(EnvFilter::new(&directives)) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, %directives, "log filter not reloaded");
                false
            }
        }
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.lock().clone()
    }

    /// Shared recorder to hand to engine components.
    pub fn metrics(&self) -> Option<Arc<MetricsRecorder>> {
        self.metrics_recorder.clone()
    }

    /// Recent warn+ events, when capture is enabled.
    pub fn logs(&self) -> Option<&MemoryLogSink> {
        self.log_sink.as_deref()
    }
}

/// Render `base,module=level,...` for an `EnvFilter`.
fn filter_directives(base: Level, modules: &[(String, Level)]) -> String {
    modules.iter().fold(
        base.to_string().to_lowercase(),
        |mut acc, (module, level)| {
            acc.push_str(&format!(",{module}={}", level.to_string().to_lowercase()));
            acc
        },
    )
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// A second call keeps the first subscriber and only builds a new guard.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(filter_directives(config.log_level, &config.module_levels))
    });
    let (filter_layer, filter) = reload::Layer::new(env_filter);

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let (capture_layer, log_sink) = if config.capture_warnings {
        let sink = Arc::new(MemoryLogSink::new(config.capture_capacity));
        (Some(CaptureLayer::new(sink.clone())), Some(sink))
    } else {
        (None, None)
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(capture_layer)
        .try_init()
    {
        eprintln!("hubmesh-telemetry: subscriber already installed: {e}");
    }

    let metrics_recorder = config
        .metrics_enabled
        .then(|| Arc::new(MetricsRecorder::new()));

    TelemetryGuard {
        log_sink,
        metrics_recorder,
        filter,
        base_level: config.log_level,
        module_levels: Mutex::new(config.module_levels),
    }
}
