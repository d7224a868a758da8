//! Listener orchestration
//!
//! [`ListenerManager`] starts one [`PortListener`] per port plus the
//! [`ControlChannel`], waits for the shutdown trigger and then stops every
//! listener. Stopping pairs the shared [`ShutdownToken`] with a loopback
//! wake connection to each port, and waits a bounded time for each listener
//! to release its socket and firewall rule.

pub mod control;
pub mod tcp;

pub use control::{request_stop, ControlChannel};
pub use tcp::PortListener;

use dashmap::DashMap;
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::HoneypotError;
use crate::events::{Event, SharedSink};
use crate::firewall::SharedGate;

/// Lifecycle of a single port listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Starting,
    AcceptingConnections,
    ShuttingDown,
    Stopped,
    Failed,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::AcceptingConnections => "accepting",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// Ports whose listener has not yet reached a terminal state
pub type ActivePorts = Arc<DashMap<u16, ListenerState>>;

/// Write side of the run's single cancellation signal
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn cancel(&self) {
        // Stored even when no listener is subscribed any more
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side handed to every listener
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled, or once the handle is gone
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

pub fn shutdown_channel() -> (ShutdownHandle, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownToken { rx })
}

/// What ended the wait for the shutdown trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    ControlConnection(SocketAddr),
    ControlBindFailed,
    ControlFailed,
    Interrupt,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ControlConnection(_) => "control_connection",
            Self::ControlBindFailed => "control_bind_error",
            Self::ControlFailed => "control_error",
            Self::Interrupt => "interrupt",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub host: String,
    pub control_port: u16,
    pub shutdown_timeout: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.listener.host.clone(),
            control_port: config.control.port,
            shutdown_timeout: config.listener.shutdown_timeout(),
        }
    }

    /// Loopback address of the same family as `host`, used for wake connections
    fn wake_ip(&self) -> IpAddr {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub accepting: Vec<u16>,
    pub failed: Vec<u16>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: Vec<u16>,
    pub failed: Vec<u16>,
    pub timed_out: Vec<u16>,
}

enum ControlState {
    Idle,
    Listening(JoinHandle<Result<SocketAddr, HoneypotError>>),
    BindFailed,
}

pub struct ListenerManager {
    settings: ManagerSettings,
    firewall: SharedGate,
    sink: SharedSink,
    shutdown: ShutdownHandle,
    listeners: HashMap<u16, JoinHandle<ListenerState>>,
    failed_at_start: BTreeSet<u16>,
    active: ActivePorts,
    control: ControlState,
}

impl ListenerManager {
    pub fn new(settings: ManagerSettings, firewall: SharedGate, sink: SharedSink) -> Self {
        let (shutdown, _) = shutdown_channel();
        Self {
            settings,
            firewall,
            sink,
            shutdown,
            listeners: HashMap::new(),
            failed_at_start: BTreeSet::new(),
            active: Arc::new(DashMap::new()),
            control: ControlState::Idle,
        }
    }

    /// Current state of `port`'s listener, `None` once it has terminated
    #[cfg(test)]
    pub fn state_of(&self, port: u16) -> Option<ListenerState> {
        self.active.get(&port).map(|state| *state)
    }

    /// Ports whose listener is still running, sorted
    pub fn active_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.active.iter().map(|entry| *entry.key()).collect();
        ports.sort_unstable();
        ports
    }

    /// Start a listener per distinct port, then the control channel. Returns
    /// once every listener is accepting or has failed to bind.
    pub async fn start<I>(&mut self, ports: I) -> Result<StartReport, HoneypotError>
    where
        I: IntoIterator<Item = u16>,
    {
        let ports: BTreeSet<u16> = ports
            .into_iter()
            .filter(|port| !self.listeners.contains_key(port))
            .collect();
        if ports.is_empty() && self.listeners.is_empty() {
            let err = HoneypotError::NoPorts;
            self.sink
                .record(Event::error(err.to_string()).with("error", err.kind()));
            return Err(err);
        }

        let opened = join_all(ports.iter().map(|&port| {
            PortListener::open(
                &self.settings.host,
                port,
                self.firewall.clone(),
                self.sink.clone(),
                self.active.clone(),
            )
        }))
        .await;

        let mut report = StartReport::default();
        for (port, result) in ports.iter().copied().zip(opened) {
            match result {
                Ok(listener) => {
                    let task = tokio::spawn(listener.run(self.shutdown.token()));
                    self.listeners.insert(port, task);
                    report.accepting.push(port);
                }
                Err(e) => {
                    debug!(port, error = %e, "Listener failed to start");
                    self.failed_at_start.insert(port);
                    report.failed.push(port);
                }
            }
        }

        if matches!(self.control, ControlState::Idle) {
            self.start_control().await;
        }

        info!(
            "Started {} listeners ({} failed)",
            report.accepting.len(),
            report.failed.len()
        );
        self.sink.record(
            Event::info(format!("Started {} listeners", report.accepting.len()))
                .with("accepting", report.accepting.clone())
                .with("failed", report.failed.clone()),
        );
        Ok(report)
    }

    async fn start_control(&mut self) {
        let port = self.settings.control_port;
        self.control = match ControlChannel::bind(port, self.sink.clone()).await {
            Ok(channel) => ControlState::Listening(tokio::spawn(channel.wait())),
            Err(e) => {
                warn!("{}", e);
                self.sink.record(
                    Event::error(format!("Control channel unavailable on port {}", port))
                        .with("port", port)
                        .with("error", e.kind())
                        .with("detail", e.to_string()),
                );
                ControlState::BindFailed
            }
        };
    }

    /// Block until the control channel fires or reports that it cannot.
    /// Cancel-safe: dropping the future keeps the control channel listening.
    pub async fn await_shutdown_trigger(&mut self) -> Trigger {
        let outcome = match &mut self.control {
            ControlState::Listening(task) => task.await,
            ControlState::BindFailed => return Trigger::ControlBindFailed,
            ControlState::Idle => return Trigger::ControlFailed,
        };
        self.control = ControlState::Idle;

        match outcome {
            Ok(Ok(peer)) => Trigger::ControlConnection(peer),
            Ok(Err(e)) => {
                self.sink.record(
                    Event::error("Control channel failed")
                        .with("port", self.settings.control_port)
                        .with("error", e.kind())
                        .with("detail", e.to_string()),
                );
                Trigger::ControlFailed
            }
            Err(e) => {
                warn!("Control channel task ended abnormally: {}", e);
                Trigger::ControlFailed
            }
        }
    }

    /// Cancel every listener, wake those parked in accept, and wait for each
    /// to reach a terminal state or its timeout.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        self.shutdown.cancel();

        let pending = self.active_ports();
        info!("Shutting down {} listeners", pending.len());
        let wake_ip = self.settings.wake_ip();
        join_all(pending.iter().map(|&port| wake(SocketAddr::new(wake_ip, port)))).await;

        let timeout = self.settings.shutdown_timeout;
        let waits = self.listeners.drain().map(|(port, task)| async move {
            (port, tokio::time::timeout(timeout, task).await)
        });
        let results = join_all(waits).await;

        let mut report = ShutdownReport {
            failed: self.failed_at_start.iter().copied().collect(),
            ..Default::default()
        };
        for (port, result) in results {
            match result {
                Ok(Ok(ListenerState::Failed)) => report.failed.push(port),
                Ok(Ok(_)) => report.stopped.push(port),
                Ok(Err(e)) => {
                    warn!(port, error = %e, "Listener task ended abnormally");
                    report.failed.push(port);
                }
                Err(_) => {
                    // Abandoned: the detached task may still finish its cleanup later
                    let err = HoneypotError::ShutdownTimeout { port, timeout };
                    warn!("{}", err);
                    self.sink.record(
                        Event::error(format!("Listener on port {} did not stop in time", port))
                            .with("port", port)
                            .with("error", err.kind())
                            .with("detail", err.to_string()),
                    );
                    report.timed_out.push(port);
                }
            }
        }
        report.stopped.sort_unstable();
        report.failed.sort_unstable();
        report.timed_out.sort_unstable();

        if let ControlState::Listening(task) = std::mem::replace(&mut self.control, ControlState::Idle) {
            task.abort();
            let _ = task.await;
        }

        self.sink.record(
            Event::info("Shutdown complete")
                .with("stopped", report.stopped.clone())
                .with("failed", report.failed.clone())
                .with("timed_out", report.timed_out.clone()),
        );
        report
    }

    /// Start, wait for the control channel or Ctrl-C, then shut down.
    pub async fn run<I>(&mut self, ports: I) -> Result<ShutdownReport, HoneypotError>
    where
        I: IntoIterator<Item = u16>,
    {
        let report = self.start(ports).await?;
        if report.accepting.is_empty() {
            warn!("No listener could be started, shutting down");
            self.sink.record(
                Event::error("No listener could be started")
                    .with("failed", report.failed.clone()),
            );
            return Ok(self.shutdown().await);
        }

        let trigger = tokio::select! {
            trigger = self.await_shutdown_trigger() => trigger,
            _ = tokio::signal::ctrl_c() => Trigger::Interrupt,
        };
        info!(trigger = trigger.as_str(), "Shutdown triggered");
        self.sink
            .record(Event::info("Shutdown triggered").with("trigger", trigger.as_str()));

        Ok(self.shutdown().await)
    }
}

/// Loopback connection that unblocks a listener parked in accept
async fn wake(addr: SocketAddr) {
    match tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => drop(stream),
        Ok(Err(e)) => debug!(%addr, error = %e, "Wake connection refused"),
        Err(_) => debug!(%addr, "Wake connection timed out"),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::error::FirewallError;
    use crate::events::EventKind;
    use crate::firewall::{FirewallGate, MemoryGate, RuleHandle};
    use async_trait::async_trait;

    fn settings(control_port: u16) -> ManagerSettings {
        ManagerSettings {
            host: "0.0.0.0".to_string(),
            control_port,
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    fn manager(gate: &MemoryGate, sink: SharedSink, control_port: u16) -> ListenerManager {
        ListenerManager::new(settings(control_port), Arc::new(gate.clone()), sink)
    }

    #[tokio::test]
    async fn test_shutdown_token() {
        let (handle, mut token) = shutdown_channel();
        assert!(!token.is_cancelled());
        handle.cancel();
        token.cancelled().await;
        assert!(token.is_cancelled());
        assert!(handle.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_empty_port_set_is_rejected() {
        let gate = MemoryGate::new("honeypot");
        let (sink, _rx) = recording_sink();
        let mut manager = manager(&gate, sink, free_port());

        let err = manager.start(Vec::new()).await.unwrap_err();
        assert!(matches!(err, HoneypotError::NoPorts));
    }

    #[tokio::test]
    async fn test_duplicate_ports_start_one_listener() {
        let gate = MemoryGate::new("honeypot");
        let (sink, _rx) = recording_sink();
        let ports = free_ports(2);
        let (control, port) = (ports[0], ports[1]);
        let mut manager = manager(&gate, sink, control);

        let report = manager.start([port, port, port]).await.unwrap();
        assert_eq!(report.accepting, vec![port]);
        assert_eq!(gate.created_count(port), 1);
        assert_eq!(manager.active_ports(), vec![port]);

        let report = manager.shutdown().await;
        assert_eq!(report.stopped, vec![port]);
        assert!(gate.open_ports().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_observed_connection_keeps_listener_accepting() {
        let gate = MemoryGate::new("honeypot");
        let (sink, mut rx) = recording_sink();
        let ports = free_ports(3);
        let (a, b) = (ports[1], ports[2]);
        let mut manager = manager(&gate, sink, ports[0]);

        manager.start([a, b]).await.unwrap();
        let _stream = connect_from("127.0.0.2", a).await;

        let event = next_event(&mut rx, |e| e.kind == EventKind::Connection).await;
        assert_eq!(event.port(), Some(a));
        assert_eq!(event.classification(), Some("observed_connection"));
        assert_eq!(manager.state_of(a), Some(ListenerState::AcceptingConnections));
        assert_eq!(manager.state_of(b), Some(ListenerState::AcceptingConnections));
        assert!(gate.is_open(a) && gate.is_open(b));

        manager.shutdown().await;
        assert!(gate.open_ports().is_empty());
    }

    #[tokio::test]
    async fn test_loopback_connection_stops_only_that_port() {
        let gate = MemoryGate::new("honeypot");
        let (sink, mut rx) = recording_sink();
        let ports = free_ports(3);
        let (a, b) = (ports[1], ports[2]);
        let mut manager = manager(&gate, sink, ports[0]);

        manager.start([a, b]).await.unwrap();
        TcpStream::connect(("127.0.0.1", a)).await.unwrap();

        let signal = next_event(&mut rx, |e| e.kind == EventKind::Connection).await;
        assert_eq!(signal.port(), Some(a));
        assert_eq!(signal.classification(), Some("shutdown_signal"));
        let stopped = next_event(&mut rx, |e| e.kind == EventKind::Stopped).await;
        assert_eq!(stopped.port(), Some(a));

        assert!(!gate.is_open(a));
        assert!(gate.is_open(b));
        assert_eq!(manager.state_of(b), Some(ListenerState::AcceptingConnections));

        let report = manager.shutdown().await;
        assert_eq!(report.stopped.len(), 2);
        assert!(gate.open_ports().is_empty());
    }

    #[tokio::test]
    async fn test_control_connection_stops_everything() {
        let gate = MemoryGate::new("honeypot");
        let (sink, _rx) = recording_sink();
        let ports = free_ports(3);
        let (control_port, a, b) = (ports[0], ports[1], ports[2]);
        let mut manager = manager(&gate, sink, control_port);

        manager.start([a, b]).await.unwrap();
        request_stop(control_port).await.unwrap();

        let trigger = manager.await_shutdown_trigger().await;
        assert!(matches!(trigger, Trigger::ControlConnection(_)));

        let mut expected = vec![a, b];
        expected.sort_unstable();
        let report = manager.shutdown().await;
        assert_eq!(report.stopped, expected);
        assert!(report.timed_out.is_empty());
        assert!(gate.open_ports().is_empty());
        assert_eq!(gate.removed_count(a), 1);
        assert_eq!(gate.removed_count(b), 1);
        assert!(manager.active_ports().is_empty());
    }

    #[tokio::test]
    async fn test_control_bind_failure_still_tears_down() {
        let gate = MemoryGate::new("honeypot");
        let (sink, mut rx) = recording_sink();
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let control_port = occupied.local_addr().unwrap().port();
        let mut manager = manager(&gate, sink, control_port);
        let port = free_port();

        manager.start([port]).await.unwrap();
        let error = next_event(&mut rx, |e| e.kind == EventKind::Error).await;
        assert_eq!(error.fields["error"], "control_bind_error");

        assert_eq!(manager.await_shutdown_trigger().await, Trigger::ControlBindFailed);
        let report = manager.shutdown().await;
        assert_eq!(report.stopped, vec![port]);
        assert!(gate.open_ports().is_empty());
    }

    #[tokio::test]
    async fn test_bind_conflict_isolated_to_one_port() {
        let gate = MemoryGate::new("honeypot");
        let (sink, mut rx) = recording_sink();
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let taken = occupied.local_addr().unwrap().port();
        let ports = free_ports(2);
        let free = ports[1];
        let mut manager = manager(&gate, sink, ports[0]);

        let report = manager.start([taken, free]).await.unwrap();
        assert_eq!(report.failed, vec![taken]);
        assert_eq!(report.accepting, vec![free]);

        let error = next_event(&mut rx, |e| e.kind == EventKind::Error).await;
        assert_eq!(error.port(), Some(taken));
        assert_eq!(error.fields["error"], "bind_error");
        assert!(!gate.is_open(taken));
        assert!(gate.is_open(free));

        let report = manager.shutdown().await;
        assert_eq!(report.failed, vec![taken]);
        assert_eq!(report.stopped, vec![free]);
        assert!(gate.open_ports().is_empty());
    }

    #[tokio::test]
    async fn test_run_returns_when_no_listener_starts() {
        let gate = MemoryGate::new("honeypot");
        let (sink, mut rx) = recording_sink();
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let taken = occupied.local_addr().unwrap().port();
        let mut manager = manager(&gate, sink, free_port());

        let report = tokio::time::timeout(Duration::from_secs(5), manager.run([taken]))
            .await
            .expect("run kept waiting without listeners")
            .unwrap();
        assert_eq!(report.failed, vec![taken]);
        assert!(report.stopped.is_empty());

        let event = next_event(&mut rx, |e| e.message == "No listener could be started").await;
        assert_eq!(event.fields["failed"], serde_json::json!([taken]));
        assert!(gate.open_ports().is_empty());
    }

    /// Gate whose removal never completes
    struct StuckGate;

    #[async_trait]
    impl FirewallGate for StuckGate {
        async fn ensure(&self, port: u16) -> Result<RuleHandle, FirewallError> {
            Ok(RuleHandle {
                port,
                name: format!("stuck-{}", port),
            })
        }

        async fn remove(&self, _handle: RuleHandle) -> Result<(), FirewallError> {
            futures::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "stuck"
        }
    }

    #[tokio::test]
    async fn test_stuck_listener_times_out() {
        let (sink, mut rx) = recording_sink();
        let ports = free_ports(2);
        let mut settings = settings(ports[0]);
        settings.shutdown_timeout = Duration::from_millis(200);
        let mut manager = ListenerManager::new(settings, Arc::new(StuckGate), sink);
        let port = ports[1];

        manager.start([port]).await.unwrap();
        let report = manager.shutdown().await;
        assert_eq!(report.timed_out, vec![port]);

        let error = next_event(&mut rx, |e| e.kind == EventKind::Error).await;
        assert_eq!(error.fields["error"], "shutdown_timeout");
    }
}
