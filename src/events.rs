//! Recorded events and the sinks that consume them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
#[cfg(test)]
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Info,
    Connection,
    Stopped,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Connection => "connection",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

/// How an accepted connection was interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    ShutdownSignal,
    ObservedConnection,
}

impl Classification {
    /// Exact match against 127.0.0.1 / ::1. Other 127/8 addresses are observed traffic.
    pub fn of(peer: IpAddr) -> Self {
        match peer.to_canonical() {
            IpAddr::V4(ip) if ip == Ipv4Addr::LOCALHOST => Self::ShutdownSignal,
            IpAddr::V6(ip) if ip == Ipv6Addr::LOCALHOST => Self::ShutdownSignal,
            _ => Self::ObservedConnection,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShutdownSignal => "shutdown_signal",
            Self::ObservedConnection => "observed_connection",
        }
    }
}

/// A single entry handed to an [`EventSink`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub message: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
            fields: Map::new(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(EventKind::Info, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, message)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn port(&self) -> Option<u16> {
        self.fields
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
    }

    pub fn source(&self) -> Option<&str> {
        self.fields.get("source").and_then(Value::as_str)
    }

    pub fn classification(&self) -> Option<&str> {
        self.fields.get("classification").and_then(Value::as_str)
    }
}

/// Immutable record of one accepted connection
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub port: u16,
    pub source: SocketAddr,
    pub timestamp: DateTime<Utc>,
    pub classification: Classification,
}

impl ConnectionEvent {
    pub fn new(port: u16, source: SocketAddr) -> Self {
        Self {
            port,
            source,
            timestamp: Utc::now(),
            classification: Classification::of(source.ip()),
        }
    }
}

impl From<ConnectionEvent> for Event {
    fn from(c: ConnectionEvent) -> Self {
        let message = match c.classification {
            Classification::ShutdownSignal => format!("Shutdown signal on port {}", c.port),
            Classification::ObservedConnection => {
                format!("Connection from {} to port {}", c.source, c.port)
            }
        };
        Event {
            timestamp: c.timestamp,
            kind: EventKind::Connection,
            message,
            fields: Map::new(),
        }
        .with("port", c.port)
        .with("source", c.source.ip().to_string())
        .with("source_port", c.source.port())
        .with("classification", c.classification.as_str())
    }
}

/// Capability to record events. Implementations must not block the caller.
pub trait EventSink: Send + Sync {
    fn record(&self, event: Event);
}

pub type SharedSink = Arc<dyn EventSink>;

/// Writes every event through `tracing`
#[derive(Debug, Default, Clone)]
pub struct LogSink;

impl EventSink for LogSink {
    fn record(&self, event: Event) {
        let fields = Value::Object(event.fields.clone());
        match event.kind {
            EventKind::Error => error!(kind = event.kind.as_str(), %fields, "{}", event.message),
            _ => info!(kind = event.kind.as_str(), %fields, "{}", event.message),
        }
    }
}

/// Broadcasts events to in-process subscribers
#[cfg(test)]
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<Event>>,
}

#[cfg(test)]
impl EventBus {
    pub fn new(sender: broadcast::Sender<Arc<Event>>) -> Self {
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
impl EventSink for EventBus {
    fn record(&self, event: Event) {
        self.publish(event);
    }
}

/// Forwards each event to several sinks in order
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedSink) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn record(&self, event: Event) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}
