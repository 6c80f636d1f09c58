use crate::types::network::Network;
use crate::types::Ipv4Net;

pub const NAT_TABLE: &str = "nat";
pub const FILTER_TABLE: &str = "filter";

/// Top-level chains owned by the host.
pub const POSTROUTING_CHAIN: &str = "POSTROUTING";
pub const FORWARD_CHAIN: &str = "FORWARD";

/// Custom chains owned by the overlay, so rule ordering is controlled
/// independently of other tenants (container runtimes, firewalls) on the
/// host.
pub const OVERLAY_POSTROUTING_CHAIN: &str = "POSTROUTING-OVERLAY";
pub const OVERLAY_FORWARD_CHAIN: &str = "FORWARD-OVERLAY";

/// A single iptables rule: where it goes and the matcher/target spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub id: String,
    pub table: &'static str,
    pub chain: String,
    pub spec: Vec<String>,
}

impl Rule {
    fn new(id: &str, table: &'static str, chain: &str, spec: &[&str]) -> Rule {
        Rule {
            id: id.to_string(),
            table,
            chain: chain.to_string(),
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// The jump from nat POSTROUTING into the overlay chain. Appended: NAT rules
/// have no ordering dependency on other tenants.
pub fn masq_jump_rule() -> Rule {
    Rule::new(
        "jump-to-overlay-postrouting",
        NAT_TABLE,
        POSTROUTING_CHAIN,
        &[
            "-m", "comment", "--comment", "weft masq",
            "-j", OVERLAY_POSTROUTING_CHAIN,
        ],
    )
}

/// NAT for traffic leaving the local subnet toward anything outside the
/// network supernet, so workloads can reach the internet.
pub fn masq_rule(network: &Ipv4Net, subnet: &Ipv4Net, random_fully: bool) -> Rule {
    let network = network.to_string();
    let subnet = subnet.to_string();

    let mut spec = vec![
        "-s", subnet.as_str(),
        "!", "-d", network.as_str(),
        "-m", "comment", "--comment", "weft masq",
        "-j", "MASQUERADE",
    ];
    if random_fully {
        spec.push("--random-fully");
    }

    Rule::new(
        if random_fully {
            "masquerade-to-external-random-fully"
        } else {
            "masquerade-to-external"
        },
        NAT_TABLE,
        OVERLAY_POSTROUTING_CHAIN,
        &spec,
    )
}

/// The jump from the top-level FORWARD chain into the overlay chain. This
/// rule must sit at position 1: container-runtime chains on the same host
/// typically fall through to a DROP policy, so the overlay's accepts have to
/// run first.
pub fn forward_jump_rule() -> Rule {
    Rule::new(
        "jump-to-overlay-forward",
        FILTER_TABLE,
        FORWARD_CHAIN,
        &[
            "-m", "comment", "--comment", "weft forward",
            "-j", OVERLAY_FORWARD_CHAIN,
        ],
    )
}

/// The per-network forwarding accepts, in chain order. The conntrack rule
/// must stay first within the overlay chain: isolation REJECTs are inserted
/// directly behind it.
pub fn forward_rules(network: &Network) -> Vec<Rule> {
    let cidr = match network.ipv4.as_ref() {
        Some(ipv4) => ipv4.network.to_string(),
        None => return Vec::new(),
    };
    let cidr = cidr.as_str();
    let bridge = network.bridge_interface_name();
    let bridge = bridge.as_str();
    let tunnel = network.interface_name();
    let tunnel = tunnel.as_str();

    vec![
        // Return traffic for established connections.
        Rule::new(
            "accept-established-related",
            FILTER_TABLE,
            OVERLAY_FORWARD_CHAIN,
            &[
                "-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED",
                "-m", "comment", "--comment", "weft forward established",
                "-j", "ACCEPT",
            ],
        ),
        // Workloads out to the internet, but not to other overlay networks.
        Rule::new(
            "accept-forward-from-bridge-to-external",
            FILTER_TABLE,
            OVERLAY_FORWARD_CHAIN,
            &[
                "-i", bridge, "-s", cidr, "!", "-d", cidr,
                "-m", "comment", "--comment", "weft forward to external",
                "-j", "ACCEPT",
            ],
        ),
        // Inbound traffic that doesn't match conntrack state.
        Rule::new(
            "accept-forward-to-bridge-from-external",
            FILTER_TABLE,
            OVERLAY_FORWARD_CHAIN,
            &[
                "-o", bridge, "-d", cidr, "!", "-s", cidr,
                "-m", "comment", "--comment", "weft forward from external",
                "-j", "ACCEPT",
            ],
        ),
        // Same network, same host.
        Rule::new(
            "accept-forward-within-network-local",
            FILTER_TABLE,
            OVERLAY_FORWARD_CHAIN,
            &[
                "-i", bridge, "-o", bridge, "-s", cidr, "-d", cidr,
                "-m", "comment", "--comment", "weft forward intra-network local",
                "-j", "ACCEPT",
            ],
        ),
        // Workloads to remote hosts over the tunnel.
        Rule::new(
            "accept-forward-bridge-to-tunnel",
            FILTER_TABLE,
            OVERLAY_FORWARD_CHAIN,
            &[
                "-i", bridge, "-o", tunnel, "-s", cidr, "-d", cidr,
                "-m", "comment", "--comment", "weft forward bridge to tunnel",
                "-j", "ACCEPT",
            ],
        ),
        // Remote hosts to local workloads.
        Rule::new(
            "accept-forward-tunnel-to-bridge",
            FILTER_TABLE,
            OVERLAY_FORWARD_CHAIN,
            &[
                "-i", tunnel, "-o", bridge, "-s", cidr, "-d", cidr,
                "-m", "comment", "--comment", "weft forward tunnel to bridge",
                "-j", "ACCEPT",
            ],
        ),
    ]
}

/// One REJECT per ordered pair of distinct networks. The `+` wildcard
/// matches every interface belonging to a network, bridge and tunnel alike.
pub fn isolation_rules(networks: &[Network]) -> Vec<Rule> {
    let mut rules = Vec::new();

    for source in networks {
        let source_prefix = format!("{}+", source.name);

        for dest in networks {
            if source.name == dest.name {
                continue;
            }
            let dest_prefix = format!("{}+", dest.name);
            let comment = format!("weft isolate {} from {}", source.name, dest.name);

            rules.push(Rule::new(
                &format!("reject-{}-to-{}", source.name, dest.name),
                FILTER_TABLE,
                OVERLAY_FORWARD_CHAIN,
                &[
                    "-i", &source_prefix, "-o", &dest_prefix,
                    "-m", "comment", "--comment", &comment,
                    "-j", "REJECT", "--reject-with", "icmp-net-prohibited",
                ],
            ));
        }
    }

    rules
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
    fn masq_rule_excludes_the_supernet() {
        let network: Ipv4Net = "10.10.0.0/16".parse().unwrap();
        let subnet: Ipv4Net = "10.10.5.0/24".parse().unwrap();

        let rule = masq_rule(&network, &subnet, false);
        assert_eq!(rule.table, NAT_TABLE);
        assert_eq!(rule.chain, OVERLAY_POSTROUTING_CHAIN);
        assert_eq!(
            rule.spec[..5],
            ["-s", "10.10.5.0/24", "!", "-d", "10.10.0.0/16"].map(String::from)
        );
        assert!(!rule.spec.contains(&"--random-fully".to_string()));

        let rule = masq_rule(&network, &subnet, true);
        assert_eq!(rule.spec.last().unwrap(), "--random-fully");
    }

    #[test]
    fn forward_rules_start_with_conntrack_accept() {
        let rules = forward_rules(&test_network("v"));
        assert_eq!(rules.len(), 6);
        assert_eq!(rules[0].id, "accept-established-related");
        assert!(rules.iter().all(|r| r.chain == OVERLAY_FORWARD_CHAIN));
    }

    #[test]
    fn forward_rules_cover_both_tunnel_directions() {
        let rules = forward_rules(&test_network("v"));

        let has_pair = |rule: &Rule, flag: &str, value: &str| {
            rule.spec
                .windows(2)
                .any(|w| w[0] == flag && w[1] == value)
        };

        let bridge_to_tunnel = &rules[4];
        assert!(has_pair(bridge_to_tunnel, "-i", "vbrd0"));
        assert!(has_pair(bridge_to_tunnel, "-o", "v0"));

        let tunnel_to_bridge = &rules[5];
        assert!(has_pair(tunnel_to_bridge, "-i", "v0"));
        assert!(has_pair(tunnel_to_bridge, "-o", "vbrd0"));
    }

    #[test]
    fn isolation_covers_every_ordered_pair() {
        let networks = vec![test_network("a"), test_network("b"), test_network("c")];
        let rules = isolation_rules(&networks);

        assert_eq!(rules.len(), 6);
        let ids: Vec<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&"reject-a-to-b"));
        assert!(ids.contains(&"reject-b-to-a"));
        assert!(ids.contains(&"reject-c-to-b"));
    }

    #[test]
    fn isolation_uses_interface_wildcards() {
        let networks = vec![test_network("a"), test_network("b")];
        let rules = isolation_rules(&networks);

        let first = &rules[0];
        assert_eq!(first.spec[..4], ["-i", "a+", "-o", "b+"].map(String::from));
        assert_eq!(
            first.spec[first.spec.len() - 4..],
            ["-j", "REJECT", "--reject-with", "icmp-net-prohibited"].map(String::from)
        );
    }

    #[test]
    fn jump_rules_target_overlay_chains() {
        assert_eq!(
            masq_jump_rule().spec.last().unwrap(),
            OVERLAY_POSTROUTING_CHAIN
        );
        assert_eq!(
            forward_jump_rule().spec.last().unwrap(),
            OVERLAY_FORWARD_CHAIN
        );
    }
}
