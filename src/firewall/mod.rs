//! Host firewall exposure for listener ports
//!
//! A [`FirewallGate`] opens an inbound-allow rule for a port and removes it
//! again. `ensure` is idempotent: a rule that already exists under the same
//! name is adopted rather than duplicated.

mod iptables;
mod memory;
mod netsh;

pub use iptables::IptablesGate;
pub use memory::MemoryGate;
pub use netsh::NetshGate;

use async_trait::async_trait;
use std::process::Output;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{FirewallBackend, FirewallConfig};
use crate::error::FirewallError;

/// Handle to a rule created (or adopted) by [`FirewallGate::ensure`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleHandle {
    pub port: u16,
    pub name: String,
}

#[async_trait]
pub trait FirewallGate: Send + Sync {
    /// Open inbound TCP exposure for `port`. No-op if the rule exists.
    async fn ensure(&self, port: u16) -> Result<RuleHandle, FirewallError>;

    /// Remove the rule behind `handle`.
    async fn remove(&self, handle: RuleHandle) -> Result<(), FirewallError>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

pub type SharedGate = Arc<dyn FirewallGate>;

/// Gate that never touches the host firewall
#[derive(Debug, Clone)]
pub struct DisabledGate {
    prefix: String,
}

impl DisabledGate {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

#[async_trait]
impl FirewallGate for DisabledGate {
    async fn ensure(&self, port: u16) -> Result<RuleHandle, FirewallError> {
        debug!(port, "Firewall management disabled, not opening port");
        Ok(RuleHandle {
            port,
            name: rule_name(&self.prefix, port),
        })
    }

    async fn remove(&self, _handle: RuleHandle) -> Result<(), FirewallError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Build the gate selected by configuration
pub fn from_config(config: &FirewallConfig) -> SharedGate {
    let prefix = config.rule_prefix.clone();
    let gate: SharedGate = match config.backend {
        FirewallBackend::Iptables => Arc::new(IptablesGate::new(prefix)),
        FirewallBackend::Netsh => Arc::new(NetshGate::new(prefix)),
        FirewallBackend::Memory => Arc::new(MemoryGate::new(prefix)),
        FirewallBackend::None => Arc::new(DisabledGate::new(prefix)),
    };
    info!(backend = gate.name(), "Firewall backend selected");
    gate
}

/// Stable per-port rule name, `<prefix>-<port>`
pub fn rule_name(prefix: &str, port: u16) -> String {
    format!("{}-{}", prefix, port)
}

/// Run a firewall command, returning its output whatever the exit status.
async fn run(program: &str, args: &[String]) -> Result<Output, FirewallError> {
    let cmd = describe(program, args);
    debug!("Running: {}", cmd);

    Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| FirewallError::CommandFailed { cmd, source: e })
}

/// Run a firewall command that must succeed.
async fn run_checked(program: &str, args: &[String]) -> Result<(), FirewallError> {
    let output = run(program, args).await?;
    if !output.status.success() {
        return Err(command_error(program, args, &output));
    }
    Ok(())
}

/// Error for a command that exited with an unexpected status
fn command_error(program: &str, args: &[String], output: &Output) -> FirewallError {
    let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        stderr = match output.status.code() {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };
    }
    FirewallError::CommandError {
        cmd: describe(program, args),
        stderr,
    }
}

fn describe(program: &str, args: &[String]) -> String {
    format!("{} {}", program, args.join(" "))
}
