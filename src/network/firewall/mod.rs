// iptables programming for the overlay: masquerade, forwarding, and
// cross-network isolation. All rules live in custom chains so their ordering
// is controlled here rather than by whatever else manages the host firewall.

pub mod rule;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::network::error::{NetworkError, NetworkResult};
use crate::types::network::Network;
use crate::types::Subnet;

use self::rule::{
    forward_jump_rule, forward_rules, isolation_rules, masq_jump_rule, masq_rule, Rule,
    FILTER_TABLE, FORWARD_CHAIN, NAT_TABLE, OVERLAY_FORWARD_CHAIN, OVERLAY_POSTROUTING_CHAIN,
};

const IPTABLES_BIN: &str = "iptables";

/// `--random-fully` on MASQUERADE needs at least this iptables version.
const RANDOM_FULLY_MIN_VERSION: (u32, u32, u32) = (1, 6, 2);

/// Manages the overlay's packet-filter rules. iptables is not reentrant, so
/// every public operation holds an internal lock for its full duration; only
/// one filter operation is ever in flight.
pub struct FirewallManager {
    lock: Mutex<()>,
    random_fully: bool,
}

impl FirewallManager {
    pub async fn new() -> NetworkResult<FirewallManager> {
        let raw = run(&["--version".to_string()]).await?;
        let random_fully = parse_version(&raw)
            .map(|v| v >= RANDOM_FULLY_MIN_VERSION)
            .unwrap_or(false);

        Ok(FirewallManager {
            lock: Mutex::new(()),
            random_fully,
        })
    }

    /// Ensures NAT rules for traffic leaving a local subnet: the custom nat
    /// chain, the jump into it from POSTROUTING, and the masquerade rule.
    pub async fn setup_masq_rules(&self, network: &Network, subnet: &Subnet) -> NetworkResult<()> {
        let _guard = self.lock.lock().await;

        let network_cidr = network
            .ipv4
            .as_ref()
            .ok_or_else(|| NetworkError::MissingIpv4(network.name.clone()))?
            .network;
        let subnet_cidr = subnet
            .ipv4_network
            .ok_or(NetworkError::IncompleteSubnet("ipv4_network"))?;

        tracing::debug!(
            network_cidr = %network_cidr,
            subnet_cidr = %subnet_cidr,
            "setting up masquerade rules",
        );

        self.ensure_chain(NAT_TABLE, OVERLAY_POSTROUTING_CHAIN).await?;
        self.apply_rule(&masq_jump_rule()).await?;
        self.apply_rule(&masq_rule(&network_cidr, &subnet_cidr, self.random_fully))
            .await?;

        tracing::info!(
            network_cidr = %network_cidr,
            subnet_cidr = %subnet_cidr,
            "masquerade rules in place",
        );
        Ok(())
    }

    /// Ensures the per-network forwarding accepts and re-seats the jump from
    /// FORWARD at position 1, ahead of any container-runtime chains whose
    /// fall-through is a DROP.
    pub async fn setup_forward_rules(&self, network: &Network) -> NetworkResult<()> {
        let _guard = self.lock.lock().await;

        tracing::debug!(
            network_name = %network.name,
            bridge_interface = %network.bridge_interface_name(),
            network_interface = %network.interface_name(),
            "setting up forward rules",
        );

        self.ensure_chain(FILTER_TABLE, OVERLAY_FORWARD_CHAIN).await?;

        for rule in forward_rules(network) {
            self.apply_rule(&rule).await?;
        }

        self.ensure_jump_rule_first().await?;

        tracing::info!(network_name = %network.name, "forward rules in place");
        Ok(())
    }

    /// Installs pairwise REJECT rules between every pair of distinct
    /// networks, inserted at position 2 of the overlay forward chain: behind
    /// the conntrack accept, ahead of every other accept.
    pub async fn ensure_isolation(&self, networks: &[Network]) -> NetworkResult<()> {
        let _guard = self.lock.lock().await;

        if networks.len() < 2 {
            tracing::debug!(network_count = networks.len(), "no isolation rules needed");
            return Ok(());
        }

        self.ensure_chain(FILTER_TABLE, OVERLAY_FORWARD_CHAIN).await?;

        // Every insert lands at position 2 and pushes earlier inserts down
        // one slot, so the list is walked back to front: the first computed
        // pair ends up directly behind the conntrack accept.
        let rules = isolation_rules(networks);
        for rule in rules.iter().rev() {
            if self.exists(rule).await? {
                tracing::debug!(rule_id = %rule.id, "isolation rule already exists, skipping");
                continue;
            }
            self.insert_rule(rule, 2).await?;
            tracing::info!(rule_id = %rule.id, "inserted isolation rule");
        }

        tracing::info!(
            network_count = networks.len(),
            rule_count = rules.len(),
            "network isolation ensured",
        );
        Ok(())
    }

    // ── Chain and rule plumbing ───────────────────────────────────────

    async fn ensure_chain(&self, table: &'static str, chain: &str) -> NetworkResult<()> {
        let chains = self.list_chains(table).await?;
        if chains.iter().any(|c| c == chain) {
            return Ok(());
        }

        run(&to_args(&["-t", table, "-N", chain])).await?;
        tracing::info!(table, chain, "created chain");
        Ok(())
    }

    async fn list_chains(&self, table: &'static str) -> NetworkResult<Vec<String>> {
        let raw = run(&to_args(&["-t", table, "-S"])).await?;
        Ok(raw
            .lines()
            .filter_map(|line| {
                line.strip_prefix("-N ")
                    .or_else(|| line.strip_prefix("-P "))
                    .and_then(|rest| rest.split_whitespace().next())
                    .map(str::to_string)
            })
            .collect())
    }

    /// Appends a rule unless an identical one is already present.
    async fn apply_rule(&self, rule: &Rule) -> NetworkResult<()> {
        if self.exists(rule).await? {
            tracing::debug!(rule_id = %rule.id, "rule already exists, skipping");
            return Ok(());
        }

        let mut args = to_args(&["-t", rule.table, "-A", &rule.chain]);
        args.extend(rule.spec.iter().cloned());
        run(&args).await?;

        tracing::info!(rule_id = %rule.id, table = rule.table, chain = %rule.chain, "applied rule");
        Ok(())
    }

    async fn insert_rule(&self, rule: &Rule, position: u32) -> NetworkResult<()> {
        let mut args = to_args(&["-t", rule.table, "-I", &rule.chain]);
        args.push(position.to_string());
        args.extend(rule.spec.iter().cloned());
        run(&args).await?;
        Ok(())
    }

    async fn delete_rule(&self, rule: &Rule) -> NetworkResult<()> {
        let mut args = to_args(&["-t", rule.table, "-D", &rule.chain]);
        args.extend(rule.spec.iter().cloned());
        run(&args).await?;
        Ok(())
    }

    /// Checks whether an identical rule is already present; `-C` exits
    /// non-zero when it is not.
    async fn exists(&self, rule: &Rule) -> NetworkResult<bool> {
        let mut args = to_args(&["-t", rule.table, "-C", &rule.chain]);
        args.extend(rule.spec.iter().cloned());

        let output = Command::new(IPTABLES_BIN).args(&args).output().await?;
        Ok(output.status.success())
    }

    /// The jump into the overlay forward chain must be rule 1 of FORWARD.
    /// Delete-then-insert keeps it there even after other software prepends
    /// its own chains.
    async fn ensure_jump_rule_first(&self) -> NetworkResult<()> {
        let jump = forward_jump_rule();

        if self.exists(&jump).await? {
            if let Err(err) = self.delete_rule(&jump).await {
                tracing::warn!(error = %err, "failed to delete existing jump rule, inserting anyway");
            }
        }

        self.insert_rule(&jump, 1).await?;
        tracing::info!(
            table = FILTER_TABLE,
            chain = FORWARD_CHAIN,
            target = OVERLAY_FORWARD_CHAIN,
            "jump rule seated first in chain",
        );
        Ok(())
    }
}

fn to_args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

async fn run(args: &[String]) -> NetworkResult<String> {
    let output = Command::new(IPTABLES_BIN).args(args).output().await?;

    if !output.status.success() {
        return Err(NetworkError::Command {
            cmd: format!("{} {}", IPTABLES_BIN, args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses "iptables v1.8.7 (nf_tables)" into (1, 8, 7).
fn parse_version(raw: &str) -> Option<(u32, u32, u32)> {
    let token = raw.split_whitespace().find(|t| t.starts_with('v'))?;
    let mut parts = token.trim_start_matches('v').split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts
        .next()
        .map(|p| {
            p.chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
        })
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_network(name: &str) -> Network {
        let mut network: Network = serde_json::from_value(serde_json::json!({
            "name": name,
            "ipv4": {"network": "10.10.0.0/16", "size": 24},
            "provider": {"name": "vxlan"},
        }))
        .unwrap();
        network.canonicalize();
        network
    }

    #[test]
    fn isolation_rules_end_up_in_pair_order_after_insertion() {
        let networks = vec![test_network("a"), test_network("b")];
        let rules = isolation_rules(&networks);

        // Model of FORWARD-OVERLAY after setup_forward_rules: the conntrack
        // accept holds position 1. Replay the inserts exactly as
        // ensure_isolation issues them; iptables position 2 is index 1.
        let mut chain = vec!["accept-established-related".to_string()];
        for rule in rules.iter().rev() {
            chain.insert(1, rule.id.clone());
        }

        assert_eq!(
            chain,
            vec![
                "accept-established-related".to_string(),
                "reject-a-to-b".to_string(),
                "reject-b-to-a".to_string(),
            ],
        );
    }

    #[test]
    fn isolation_insertion_order_holds_for_three_networks() {
        let networks = vec![test_network("a"), test_network("b"), test_network("c")];
        let rules = isolation_rules(&networks);

        let mut chain = vec!["accept-established-related".to_string()];
        for rule in rules.iter().rev() {
            chain.insert(1, rule.id.clone());
        }

        // The chain preserves the computed pair order: every REJECT sits
        // behind the conntrack accept, first pair first.
        let expected: Vec<String> = std::iter::once("accept-established-related".to_string())
            .chain(rules.iter().map(|r| r.id.clone()))
            .collect();
        assert_eq!(chain, expected);
    }

    #[test]
    fn version_parses_common_formats() {
        assert_eq!(parse_version("iptables v1.8.7 (nf_tables)"), Some((1, 8, 7)));
        assert_eq!(parse_version("iptables v1.6.2"), Some((1, 6, 2)));
        assert_eq!(parse_version("iptables v1.4.21"), Some((1, 4, 21)));
        assert_eq!(parse_version("garbage"), None);
    }

    #[test]
    fn version_gates_random_fully() {
        let supports = |raw: &str| {
            parse_version(raw)
                .map(|v| v >= RANDOM_FULLY_MIN_VERSION)
                .unwrap_or(false)
        };
        assert!(supports("iptables v1.8.7 (nf_tables)"));
        assert!(supports("iptables v1.6.2"));
        assert!(!supports("iptables v1.6.1"));
        assert!(!supports("iptables v1.4.21"));
    }
}
