//! Windows Defender Firewall backend via `netsh advfirewall`

use async_trait::async_trait;
use tracing::{debug, info};

use super::{command_error, rule_name, run, run_checked, FirewallGate, RuleHandle};
use crate::error::FirewallError;

#[derive(Debug, Clone)]
pub struct NetshGate {
    prefix: String,
    binary: String,
}

impl NetshGate {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            binary: "netsh".to_string(),
        }
    }

    #[cfg(test)]
    fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn show_args(name: &str) -> Vec<String> {
        vec![
            "advfirewall".into(),
            "firewall".into(),
            "show".into(),
            "rule".into(),
            format!("name={}", name),
        ]
    }

    fn add_args(name: &str, port: u16) -> Vec<String> {
        vec![
            "advfirewall".into(),
            "firewall".into(),
            "add".into(),
            "rule".into(),
            format!("name={}", name),
            "dir=in".into(),
            "action=allow".into(),
            "protocol=TCP".into(),
            format!("localport={}", port),
        ]
    }

    fn delete_args(name: &str) -> Vec<String> {
        vec![
            "advfirewall".into(),
            "firewall".into(),
            "delete".into(),
            "rule".into(),
            format!("name={}", name),
        ]
    }

    /// `show rule` exits 1 when no rule matches the name
    async fn exists(&self, name: &str) -> Result<bool, FirewallError> {
        let args = Self::show_args(name);
        let output = run(&self.binary, &args).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(command_error(&self.binary, &args, &output)),
        }
    }
}

#[async_trait]
impl FirewallGate for NetshGate {
    async fn ensure(&self, port: u16) -> Result<RuleHandle, FirewallError> {
        let name = rule_name(&self.prefix, port);
        if self.exists(&name).await? {
            debug!(port, rule = %name, "Firewall rule already present");
        } else {
            run_checked(&self.binary, &Self::add_args(&name, port)).await?;
            info!(port, rule = %name, "Firewall rule added");
        }
        Ok(RuleHandle { port, name })
    }

    async fn remove(&self, handle: RuleHandle) -> Result<(), FirewallError> {
        run_checked(&self.binary, &Self::delete_args(&handle.name)).await?;
        info!(port = handle.port, rule = %handle.name, "Firewall rule removed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "netsh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_args() {
        let args = NetshGate::add_args("honeypot-2222", 2222);
        assert_eq!(
            args.join(" "),
            "advfirewall firewall add rule name=honeypot-2222 dir=in action=allow protocol=TCP localport=2222"
        );
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use crate::firewall::testing::FakeBinary;

        /// Fake netsh; the verb is the third argument after `advfirewall firewall`
        fn netsh(delete: &str) -> (FakeBinary, NetshGate) {
            let fake = FakeBinary::new(&format!(
                "case \"$3\" in\n  show) [ -f \"$dir/rule\" ] || {{ echo \"No rules match the specified criteria.\"; exit 1; }} ;;\n  add) touch \"$dir/rule\" ;;\n  delete) {} ;;\nesac",
                delete
            ));
            let gate = NetshGate::new("honeypot").with_binary(fake.program());
            (fake, gate)
        }

        fn verbs(fake: &FakeBinary) -> Vec<String> {
            fake.calls()
                .iter()
                .filter_map(|call| call.split_whitespace().nth(2).map(str::to_string))
                .collect()
        }

        #[tokio::test]
        async fn test_absent_rule_is_added_then_deleted() {
            let (fake, gate) = netsh(r#"rm "$dir/rule""#);

            let handle = gate.ensure(2222).await.unwrap();
            assert!(fake.has_rule());
            gate.remove(handle).await.unwrap();

            assert!(!fake.has_rule());
            assert_eq!(verbs(&fake), vec!["show", "add", "delete"]);
        }

        #[tokio::test]
        async fn test_present_rule_is_not_added_twice() {
            let (fake, gate) = netsh(r#"rm "$dir/rule""#);
            fake.install_rule();

            gate.ensure(2222).await.unwrap();
            assert_eq!(verbs(&fake), vec!["show"]);
        }

        #[tokio::test]
        async fn test_delete_error_is_reported() {
            let (fake, gate) = netsh(r#"echo "The requested operation requires elevation." >&2; exit 2"#);
            let handle = gate.ensure(2222).await.unwrap();

            let err = gate.remove(handle).await.unwrap_err();
            match err {
                FirewallError::CommandError { stderr, .. } => assert!(stderr.contains("elevation")),
                other => panic!("unexpected error: {other:?}"),
            }
            assert!(fake.has_rule());
        }
    }
}
