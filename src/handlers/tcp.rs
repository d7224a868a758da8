//! Per-port TCP listener
//!
//! Accepts any connection, records it and closes it straight away. A
//! connection from the loopback address is the local stop signal for this
//! port; anything else is logged as observed traffic.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::{ActivePorts, ListenerState, ShutdownToken};
use crate::error::HoneypotError;
use crate::events::{Classification, ConnectionEvent, Event, EventKind, SharedSink};
use crate::firewall::{RuleHandle, SharedGate};

/// Why the accept loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitReason {
    ShutdownSignal,
    Cancelled,
    AcceptFailed,
}

impl ExitReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ShutdownSignal => "shutdown_signal",
            Self::Cancelled => "cancelled",
            Self::AcceptFailed => "accept_error",
        }
    }
}

/// Source of accepted connections. The connection is closed before the
/// peer address is returned.
#[async_trait]
pub trait Accept: Send + Sync + 'static {
    async fn accept_peer(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept_peer(&self) -> io::Result<SocketAddr> {
        let (stream, peer_addr) = self.accept().await?;
        drop(stream);
        Ok(peer_addr)
    }
}

/// Owns one listening socket and the firewall rule that exposes it
pub struct PortListener<S = TcpListener> {
    port: u16,
    socket: S,
    rule: Option<RuleHandle>,
    firewall: SharedGate,
    sink: SharedSink,
    active: ActivePorts,
}

impl PortListener {
    /// Open firewall exposure, then bind. A failed bind rolls the rule back
    /// and leaves the port in [`ListenerState::Failed`].
    pub async fn open(
        host: &str,
        port: u16,
        firewall: SharedGate,
        sink: SharedSink,
        active: ActivePorts,
    ) -> Result<Self, HoneypotError> {
        active.insert(port, ListenerState::Starting);

        let rule = match firewall.ensure(port).await {
            Ok(rule) => Some(rule),
            Err(e) => {
                warn!(port, error = %e, "Cannot open firewall for port");
                let err = HoneypotError::from(e);
                sink.record(
                    Event::error(format!("Firewall rule for port {} not created", port))
                        .with("port", port)
                        .with("error", err.kind())
                        .with("detail", err.to_string()),
                );
                None
            }
        };

        let addr = format!("{}:{}", host, port);
        let socket = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                debug!("Cannot bind to {}: {}", addr, e);
                if let Some(rule) = rule {
                    if let Err(e) = firewall.remove(rule).await {
                        warn!(port, error = %e, "Failed to roll back firewall rule");
                    }
                }
                let err = HoneypotError::Bind { port, source: e };
                sink.record(
                    Event::error(format!("Cannot listen on port {}", port))
                        .with("port", port)
                        .with("error", err.kind())
                        .with("detail", err.to_string()),
                );
                active.remove(&port);
                return Err(err);
            }
        };

        active.insert(port, ListenerState::AcceptingConnections);
        info!("TCP listener started on port {}", port);
        sink.record(Event::info(format!("Listening on port {}", port)).with("port", port));

        Ok(Self {
            port,
            socket,
            rule,
            firewall,
            sink,
            active,
        })
    }
}

impl<S: Accept> PortListener<S> {
    /// Accept until a loopback connection, cancellation or an accept error,
    /// then release the socket and firewall rule. Returns the terminal state.
    pub async fn run(self, mut shutdown: ShutdownToken) -> ListenerState {
        let port = self.port;

        let reason = loop {
            if shutdown.is_cancelled() {
                break ExitReason::Cancelled;
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break ExitReason::Cancelled,

                result = self.socket.accept_peer() => match result {
                    Ok(peer_addr) => {
                        let event = ConnectionEvent::new(port, peer_addr);
                        let classification = event.classification;
                        self.sink.record(event.into());

                        if classification == Classification::ShutdownSignal {
                            break ExitReason::ShutdownSignal;
                        }
                    }
                    Err(e) => {
                        warn!("Accept error on port {}: {}", port, e);
                        let err = HoneypotError::Accept { port, source: e };
                        self.sink.record(
                            Event::error(format!("Accept failed on port {}", port))
                                .with("port", port)
                                .with("error", err.kind())
                                .with("detail", err.to_string()),
                        );
                        break ExitReason::AcceptFailed;
                    }
                },
            }
        };

        self.active.insert(port, ListenerState::ShuttingDown);
        debug!(port, reason = reason.as_str(), "Listener shutting down");

        let Self {
            socket,
            rule,
            firewall,
            sink,
            active,
            ..
        } = self;
        drop(socket);

        if let Some(rule) = rule {
            if let Err(e) = firewall.remove(rule).await {
                warn!(port, error = %e, "Failed to remove firewall rule");
                let err = HoneypotError::from(e);
                sink.record(
                    Event::error(format!("Firewall rule for port {} not removed", port))
                        .with("port", port)
                        .with("error", err.kind())
                        .with("detail", err.to_string()),
                );
            }
        }

        let state = match reason {
            ExitReason::AcceptFailed => ListenerState::Failed,
            _ => ListenerState::Stopped,
        };
        sink.record(
            Event::new(EventKind::Stopped, format!("Listener on port {} stopped", port))
                .with("port", port)
                .with("reason", reason.as_str())
                .with("state", state.as_str()),
        );
        active.remove(&port);
        info!("TCP listener stopped on port {}", port);

        state
    }
}
