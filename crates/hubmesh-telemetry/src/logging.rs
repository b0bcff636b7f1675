use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A captured log event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub node_id: Option<String>,
    pub hub: Option<String>,
}

/// Query parameters for searching captured logs.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub node_id: Option<String>,
    pub hub: Option<String>,
    pub limit: Option<usize>,
}

/// Bounded ring buffer of recent warn+ events.
pub struct MemoryLogSink {
    records: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
}

impl MemoryLogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    fn insert(&self, record: LogRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Matching records, most recent first.
    pub fn query(&self, q: &LogQuery) -> Vec<LogRecord> {
        let records = self.records.lock();
        records
            .iter()
            .rev()
            .filter(|r| q.level.as_deref().map_or(true, |l| r.level == l))
            .filter(|r| q.target.as_deref().map_or(true, |t| r.target.contains(t)))
            .filter(|r| {
                q.node_id
                    .as_deref()
                    .map_or(true, |n| r.node_id.as_deref() == Some(n))
            })
            .filter(|r| q.hub.as_deref().map_or(true, |h| r.hub.as_deref() == Some(h)))
            .take(q.limit.unwrap_or(100))
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.records.lock().len()
    }
}

/// tracing Layer that captures warn+ events into a [`MemoryLogSink`].
pub struct CaptureLayer {
    sink: Arc<MemoryLogSink>,
}

impl CaptureLayer {
    pub fn new(sink: Arc<MemoryLogSink>) -> Self {
        Self { sink }
    }
}

/// Visitor that extracts fields from a tracing event.
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    node_id: Option<String>,
    hub: Option<String>,
}

impl FieldVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: serde_json::Map::new(),
            node_id: None,
            hub: None,
        }
    }

    fn put_str(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "node_id" => self.node_id = Some(value),
            "hub" => self.hub = Some(value),
            name => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{:?}", value);
        let val = match field.name() {
            "message" => val,
            _ => val.trim_matches('"').to_string(),
        };
        self.put_str(field.name(), val);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put_str(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);

        // node_id / hub may live on an enclosing span instead of the event
        if visitor.node_id.is_none() || visitor.hub.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(fields) = extensions.get::<SpanFields>() {
                        if visitor.node_id.is_none() {
                            visitor.node_id.clone_from(&fields.node_id);
                        }
                        if visitor.hub.is_none() {
                            visitor.hub.clone_from(&fields.hub);
                        }
                    }
                }
            }
        }

        self.sink.insert(LogRecord {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
            node_id: visitor.node_id,
            hub: visitor.hub,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::new();
        attrs.record(&mut visitor);

        if visitor.node_id.is_some() || visitor.hub.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanFields {
                    node_id: visitor.node_id,
                    hub: visitor.hub,
                });
            }
        }
    }
}

/// Stored on spans to propagate node_id / hub to child events.
struct SpanFields {
    node_id: Option<String>,
    hub: Option<String>,
}
