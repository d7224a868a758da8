//! Linux iptables backend

use async_trait::async_trait;
use tracing::{debug, info};

use super::{command_error, rule_name, run, run_checked, FirewallGate, RuleHandle};
use crate::error::FirewallError;

/// Inserts `ACCEPT` rules into the INPUT chain, tagged with a comment
/// carrying the rule name so they can be found and deleted again.
#[derive(Debug, Clone)]
pub struct IptablesGate {
    prefix: String,
    binary: String,
    chain: String,
}

impl IptablesGate {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            binary: "iptables".to_string(),
            chain: "INPUT".to_string(),
        }
    }

    #[cfg(test)]
    fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Every call waits for the xtables lock (`-w`) instead of failing on contention
    fn rule_args(&self, action: &str, name: &str, port: u16) -> Vec<String> {
        vec![
            "-w".into(),
            action.to_string(),
            self.chain.clone(),
            "-p".into(),
            "tcp".into(),
            "--dport".into(),
            port.to_string(),
            "-m".into(),
            "comment".into(),
            "--comment".into(),
            name.to_string(),
            "-j".into(),
            "ACCEPT".into(),
        ]
    }

    /// `-C` exits 0 when the rule matches and 1 when it does not
    async fn exists(&self, name: &str, port: u16) -> Result<bool, FirewallError> {
        let args = self.rule_args("-C", name, port);
        let output = run(&self.binary, &args).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(command_error(&self.binary, &args, &output)),
        }
    }
}

#[async_trait]
impl FirewallGate for IptablesGate {
    async fn ensure(&self, port: u16) -> Result<RuleHandle, FirewallError> {
        let name = rule_name(&self.prefix, port);
        if self.exists(&name, port).await? {
            debug!(port, rule = %name, "Firewall rule already present");
        } else {
            run_checked(&self.binary, &self.rule_args("-I", &name, port)).await?;
            info!(port, rule = %name, "Firewall rule added");
        }
        Ok(RuleHandle { port, name })
    }

    async fn remove(&self, handle: RuleHandle) -> Result<(), FirewallError> {
        // -D removes one matching rule per call
        while self.exists(&handle.name, handle.port).await? {
            run_checked(&self.binary, &self.rule_args("-D", &handle.name, handle.port)).await?;
        }
        info!(port = handle.port, rule = %handle.name, "Firewall rule removed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "iptables"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_args() {
        let gate = IptablesGate::new("honeypot");
        let args = gate.rule_args("-I", "honeypot-2121", 2121);
        assert_eq!(
            args.join(" "),
            "-w -I INPUT -p tcp --dport 2121 -m comment --comment honeypot-2121 -j ACCEPT"
        );
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use crate::firewall::testing::FakeBinary;

        const CHECK: &str = r#"[ -f "$dir/rule" ]"#;
        const CHECK_LOCKED: &str =
            r#"echo "Another app is currently holding the xtables lock." >&2; exit 4"#;
        const DELETE: &str = r#"rm "$dir/rule""#;
        const DELETE_FAILS: &str = r#"echo "iptables: Bad rule." >&2; exit 2"#;

        /// Fake iptables; the action follows `-w` as the second argument
        fn iptables(check: &str, delete: &str) -> (FakeBinary, IptablesGate) {
            let fake = FakeBinary::new(&format!(
                "case \"$2\" in\n  -C) {} ;;\n  -I) touch \"$dir/rule\" ;;\n  -D) {} ;;\nesac",
                check, delete
            ));
            let gate = IptablesGate::new("honeypot").with_binary(fake.program());
            (fake, gate)
        }

        fn actions(fake: &FakeBinary) -> Vec<String> {
            fake.calls()
                .iter()
                .map(|call| call.split_whitespace().take(2).collect::<Vec<_>>().join(" "))
                .collect()
        }

        #[tokio::test]
        async fn test_absent_rule_is_inserted_and_deleted() {
            let (fake, gate) = iptables(CHECK, DELETE);

            let handle = gate.ensure(2121).await.unwrap();
            assert_eq!(handle.name, "honeypot-2121");
            assert!(fake.has_rule());

            gate.remove(handle).await.unwrap();
            assert!(!fake.has_rule());
            assert_eq!(actions(&fake), vec!["-w -C", "-w -I", "-w -C", "-w -D", "-w -C"]);
        }

        #[tokio::test]
        async fn test_present_rule_is_adopted() {
            let (fake, gate) = iptables(CHECK, DELETE);
            fake.install_rule();

            let handle = gate.ensure(2121).await.unwrap();
            assert_eq!(actions(&fake), vec!["-w -C"]);

            gate.remove(handle).await.unwrap();
            assert!(!fake.has_rule());
        }

        #[tokio::test]
        async fn test_check_error_is_not_treated_as_absent() {
            let (fake, gate) = iptables(CHECK_LOCKED, DELETE);

            let err = gate.ensure(2121).await.unwrap_err();
            match &err {
                FirewallError::CommandError { stderr, .. } => assert!(stderr.contains("xtables lock")),
                other => panic!("unexpected error: {other:?}"),
            }

            let handle = RuleHandle {
                port: 2121,
                name: "honeypot-2121".into(),
            };
            assert!(gate.remove(handle).await.is_err());
            assert_eq!(actions(&fake), vec!["-w -C", "-w -C"]);
        }

        #[tokio::test]
        async fn test_delete_error_is_reported() {
            let (fake, gate) = iptables(CHECK, DELETE_FAILS);
            let handle = gate.ensure(2222).await.unwrap();

            let err = gate.remove(handle).await.unwrap_err();
            assert!(matches!(err, FirewallError::CommandError { .. }));
            assert!(fake.has_rule());
        }
    }
}
