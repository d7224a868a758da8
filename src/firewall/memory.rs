//! In-process firewall used for dry runs and tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

use super::{rule_name, FirewallGate, RuleHandle};
use crate::error::FirewallError;

/// Tracks open rules in a map. Also counts how many times each port was
/// opened and closed.
#[derive(Debug, Clone, Default)]
pub struct MemoryGate {
    prefix: String,
    inner: Arc<Mutex<MemoryRules>>,
}

#[derive(Debug, Default)]
struct MemoryRules {
    open: HashMap<u16, String>,
    created: HashMap<u16, usize>,
    removed: HashMap<u16, usize>,
}

impl MemoryGate {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            inner: Arc::default(),
        }
    }

    fn rules(&self) -> std::sync::MutexGuard<'_, MemoryRules> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a rule for `port` is currently open
    #[cfg(test)]
    pub fn is_open(&self, port: u16) -> bool {
        self.rules().open.contains_key(&port)
    }

    /// Ports with an open rule, sorted
    #[cfg(test)]
    pub fn open_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.rules().open.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    #[cfg(test)]
    pub fn created_count(&self, port: u16) -> usize {
        self.rules().created.get(&port).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub fn removed_count(&self, port: u16) -> usize {
        self.rules().removed.get(&port).copied().unwrap_or(0)
    }
}

#[async_trait]
impl FirewallGate for MemoryGate {
    async fn ensure(&self, port: u16) -> Result<RuleHandle, FirewallError> {
        let name = rule_name(&self.prefix, port);
        let mut rules = self.rules();
        if !rules.open.contains_key(&port) {
            rules.open.insert(port, name.clone());
            let created = rules.created.entry(port).or_default();
            *created += 1;
            info!(port, rule = %name, times = *created, "Firewall rule added (dry run)");
        }
        Ok(RuleHandle { port, name })
    }

    async fn remove(&self, handle: RuleHandle) -> Result<(), FirewallError> {
        let mut rules = self.rules();
        if rules.open.remove(&handle.port).is_some() {
            let removed = rules.removed.entry(handle.port).or_default();
            *removed += 1;
            info!(
                port = handle.port,
                rule = %handle.name,
                times = *removed,
                "Firewall rule removed (dry run)"
            );
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let gate = MemoryGate::new("honeypot");
        let first = gate.ensure(2121).await.unwrap();
        let second = gate.ensure(2121).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(gate.created_count(2121), 1);
        assert_eq!(gate.open_ports(), vec![2121]);
    }

    #[tokio::test]
    async fn test_ensure_then_remove_leaves_no_rule() {
        let gate = MemoryGate::new("honeypot");
        let handle = gate.ensure(2222).await.unwrap();
        gate.remove(handle).await.unwrap();

        assert!(!gate.is_open(2222));
        assert_eq!(gate.removed_count(2222), 1);
    }
}
