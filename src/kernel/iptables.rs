//! iptables binary wrapper: idempotent MASQUERADE and CONNMARK node-port
//! rules, shelling out to the `iptables` binary the way the original's
//! `go-iptables` wrapper does under the hood.

use std::process::Command;
use std::sync::OnceLock;

pub trait IptablesOps: Send + Sync {
    fn append_unique(&self, table: &str, chain: &str, spec: &[&str]) -> anyhow::Result<()>;
    fn delete_if_present(&self, table: &str, chain: &str, spec: &[&str]) -> anyhow::Result<()>;
    fn has_random_fully(&self) -> bool;
}

pub struct ShellIptables;

impl ShellIptables {
    pub fn new() -> Self {
        ShellIptables
    }

    fn run(&self, args: &[&str]) -> anyhow::Result<std::process::Output> {
        Command::new("iptables")
            .args(args)
            .output()
            .map_err(|e| anyhow::anyhow!("failed to exec iptables: {e}"))
    }
}

impl Default for ShellIptables {
    fn default() -> Self {
        Self::new()
    }
}

impl IptablesOps for ShellIptables {
    fn append_unique(&self, table: &str, chain: &str, spec: &[&str]) -> anyhow::Result<()> {
        // Check first (-C), append only if the rule is absent, matching
        // `AppendUnique`'s semantics rather than relying on iptables's own
        // duplicate detection (it has none).
        let mut check_args = vec!["-t", table, "-C", chain];
        check_args.extend_from_slice(spec);
        if self.run(&check_args)?.status.success() {
            return Ok(());
        }
        let mut append_args = vec!["-t", table, "-A", chain];
        append_args.extend_from_slice(spec);
        let out = self.run(&append_args)?;
        if !out.status.success() {
            anyhow::bail!("iptables -A {chain} failed: {}", String::from_utf8_lossy(&out.stderr));
        }
        Ok(())
    }

    fn delete_if_present(&self, table: &str, chain: &str, spec: &[&str]) -> anyhow::Result<()> {
        let mut check_args = vec!["-t", table, "-C", chain];
        check_args.extend_from_slice(spec);
        if !self.run(&check_args)?.status.success() {
            return Ok(());
        }
        let mut del_args = vec!["-t", table, "-D", chain];
        del_args.extend_from_slice(spec);
        self.run(&del_args)?;
        Ok(())
    }

    fn has_random_fully(&self) -> bool {
        static CACHED: OnceLock<bool> = OnceLock::new();
        *CACHED.get_or_init(probe_random_fully)
    }
}

/// Older iptables versions lack `--random-fully`; detect support by
/// checking the help text for the option name rather than guessing from
/// a version string alone.
fn probe_random_fully() -> bool {
    Command::new("iptables")
        .args(["-j", "MASQUERADE", "--help"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains("random-fully"))
        .unwrap_or(false)
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeIptables {
        pub rules: Mutex<Vec<(String, String, Vec<String>)>>,
    }

    impl IptablesOps for FakeIptables {
        fn append_unique(&self, table: &str, chain: &str, spec: &[&str]) -> anyhow::Result<()> {
            let mut rules = self.rules.lock().unwrap();
            let spec_owned: Vec<String> = spec.iter().map(|s| s.to_string()).collect();
            if !rules
                .iter()
                .any(|(t, c, s)| t == table && c == chain && *s == spec_owned)
            {
                rules.push((table.to_string(), chain.to_string(), spec_owned));
            }
            Ok(())
        }
        fn delete_if_present(&self, table: &str, chain: &str, spec: &[&str]) -> anyhow::Result<()> {
            let mut rules = self.rules.lock().unwrap();
            let spec_owned: Vec<String> = spec.iter().map(|s| s.to_string()).collect();
            rules.retain(|(t, c, s)| !(t == table && c == chain && *s == spec_owned));
            Ok(())
        }
        fn has_random_fully(&self) -> bool {
            true
        }
    }
}
