//! Error types for listener and firewall operations

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the listener lifecycle.
#[derive(Debug, Error)]
pub enum HoneypotError {
    /// No ports were configured, nothing to listen on.
    #[error("no ports to listen on")]
    NoPorts,

    /// A port listener could not open its socket.
    #[error("cannot bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The control channel could not open its loopback socket.
    #[error("cannot bind control port {port}: {source}")]
    ControlBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Accepting a connection failed.
    #[error("accept failed on port {port}: {source}")]
    Accept {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// A listener did not reach a terminal state in time.
    #[error("listener on port {port} did not stop within {timeout:?}")]
    ShutdownTimeout { port: u16, timeout: Duration },

    /// Firewall exposure could not be created.
    #[error(transparent)]
    Firewall(#[from] FirewallError),
}

/// Errors raised by firewall backends.
#[derive(Debug, Error)]
pub enum FirewallError {
    /// The firewall command could not be spawned.
    #[error("failed to run '{cmd}': {source}")]
    CommandFailed {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    /// The firewall command exited with a non-zero status.
    #[error("'{cmd}' failed: {stderr}")]
    CommandError { cmd: String, stderr: String },
}

impl HoneypotError {
    /// Short stable identifier used as the `error` field of recorded events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoPorts => "no_ports",
            Self::Bind { .. } => "bind_error",
            Self::ControlBind { .. } => "control_bind_error",
            Self::Accept { .. } => "accept_error",
            Self::ShutdownTimeout { .. } => "shutdown_timeout",
            Self::Firewall(_) => "firewall_error",
        }
    }
}
