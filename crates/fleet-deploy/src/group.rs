//! Host groups and pattern-based fleet discovery

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

use crate::host::{Host, HostAction, SharedHost};
use crate::inventory::{FleetInventory, InventoryError, ServerRecord};
use crate::retry;
use crate::{Error, Result};

/// Attempts against the inventory provider before a connectivity error
/// becomes fatal
const INVENTORY_ATTEMPTS: u32 = 3;

/// Pause between inventory attempts
const INVENTORY_BACKOFF: Duration = Duration::from_secs(2);

/// The concrete hosts one user-supplied pattern resolved to
#[derive(Debug)]
pub struct HostGroup {
    name: String,
    hosts: Vec<SharedHost>,
}

impl HostGroup {
    /// Create a group; `name` is the original pattern
    pub fn new(name: impl Into<String>, hosts: Vec<SharedHost>) -> Self {
        Self {
            name: name.into(),
            hosts,
        }
    }

    /// The pattern this group resolved from
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resolved hosts
    pub fn hosts(&self) -> &[SharedHost] {
        &self.hosts
    }

    /// Mark every host for installation
    pub fn install_all(&self) {
        for host in &self.hosts {
            host.write().unwrap().add_action(HostAction::Install);
        }
    }

    /// Mark the first `count` hosts (in deterministic order) for installation
    pub fn install_number_of_hosts(&self, count: usize) {
        let count = count.min(self.hosts.len());
        for host in self.sorted_hosts().into_iter().take(count) {
            host.write().unwrap().add_action(HostAction::Install);
        }
    }

    /// Mark the first `ceil(percent%)` hosts (in deterministic order) for
    /// installation
    pub fn install_percent_of_hosts(&self, percent: u32) {
        let count = ((self.hosts.len() as f64) * (percent as f64) / 100.0).ceil() as usize;
        self.install_number_of_hosts(count);
    }

    /// Hosts sorted ascending by IP.
    ///
    /// Partial deploys slice this ordering, so growing a percentage always
    /// installs to a superset of the previous run's targets.
    pub fn sorted_hosts(&self) -> Vec<SharedHost> {
        let mut keyed: Vec<(String, SharedHost)> = self
            .hosts
            .iter()
            .map(|host| (host.read().unwrap().ip(), host.clone()))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.into_iter().map(|(_, host)| host).collect()
    }

    /// Hosts with the given action scheduled
    pub fn hosts_for_action(&self, action: HostAction) -> Vec<SharedHost> {
        self.hosts
            .iter()
            .filter(|host| host.read().unwrap().has_action(action))
            .cloned()
            .collect()
    }

    /// True when every host in the group succeeded
    pub fn success(&self) -> bool {
        self.hosts
            .iter()
            .all(|host| host.read().unwrap().success())
    }
}

/// Discovery strategies in fixed priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    IpAddress,
    InstanceId,
    Hostname,
    TagMatch,
    GroupMatch,
}

static IP_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,3}\.){3}\d{1,3}$").expect("ip matcher"));
static INSTANCE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^i-[0-9a-f]{8}$").expect("instance matcher"));
static HOSTNAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[^.]+\.").expect("hostname matcher"));
static TAG_MATCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+)=(\w+)$").expect("tag matcher"));
static GROUP_MATCH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").expect("group matcher"));

impl Strategy {
    const PRIORITY: [Strategy; 5] = [
        Strategy::IpAddress,
        Strategy::InstanceId,
        Strategy::Hostname,
        Strategy::TagMatch,
        Strategy::GroupMatch,
    ];

    fn matcher(&self) -> &'static Regex {
        match self {
            Strategy::IpAddress => &IP_ADDRESS,
            Strategy::InstanceId => &INSTANCE_ID,
            Strategy::Hostname => &HOSTNAME,
            Strategy::TagMatch => &TAG_MATCH,
            Strategy::GroupMatch => &GROUP_MATCH,
        }
    }

    async fn resolve(
        &self,
        pattern: &str,
        inventory: &dyn FleetInventory,
    ) -> Result<Vec<SharedHost>> {
        let hosts = match self {
            Strategy::IpAddress => vec![Host::ip_address(pattern).shared()],
            Strategy::Hostname => vec![Host::hostname(pattern).shared()],
            Strategy::InstanceId => {
                let server =
                    lookup(|| inventory.find_by_id(pattern)).await?;
                server
                    .filter(|server| server.public_ip.is_some())
                    .map(|server| vec![Host::instance(pattern, server).shared()])
                    .unwrap_or_default()
            }
            Strategy::TagMatch => {
                let captures = TAG_MATCH
                    .captures(pattern)
                    .ok_or_else(|| Error::Config(format!("malformed tag pattern: {pattern}")))?;
                let (key, value) = (captures[1].to_string(), captures[2].to_string());
                let servers = lookup(|| inventory.list_by_tag(&key, &value)).await?;
                instance_hosts(pattern, servers)
            }
            Strategy::GroupMatch => {
                let servers = lookup(|| inventory.list_by_group(pattern)).await?;
                instance_hosts(pattern, servers)
            }
        };
        Ok(hosts)
    }
}

async fn lookup<T, F, Fut>(op: F) -> std::result::Result<T, InventoryError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, InventoryError>>,
{
    retry::with_backoff(
        INVENTORY_ATTEMPTS,
        INVENTORY_BACKOFF,
        InventoryError::is_transient,
        op,
    )
    .await
}

fn instance_hosts(pattern: &str, servers: Vec<ServerRecord>) -> Vec<SharedHost> {
    servers
        .into_iter()
        .filter(|server| server.public_ip.is_some())
        .map(|server| Host::instance(pattern, server).shared())
        .collect()
}

/// Resolve user-supplied patterns into host groups.
///
/// Each pattern is classified by the first strategy whose matcher accepts it
/// AND whose resolution yields at least one live host; strategies that match
/// but resolve to nothing fall through. A pattern nothing claims becomes an
/// empty group, surfaced later if installation is attempted against it.
pub async fn resolve(
    patterns: &[String],
    inventory: &dyn FleetInventory,
) -> Result<Vec<HostGroup>> {
    let mut groups = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        groups.push(resolve_pattern(pattern, inventory).await?);
    }
    Ok(groups)
}

async fn resolve_pattern(pattern: &str, inventory: &dyn FleetInventory) -> Result<HostGroup> {
    for strategy in Strategy::PRIORITY {
        if !strategy.matcher().is_match(pattern) {
            continue;
        }
        let hosts = strategy.resolve(pattern, inventory).await?;
        if hosts.is_empty() {
            debug!(pattern, ?strategy, "strategy matched but resolved no live hosts");
            continue;
        }
        info!(pattern, ?strategy, count = hosts.len(), "resolved host group");
        return Ok(HostGroup::new(pattern, hosts));
    }
    debug!(pattern, "no strategy claimed pattern, returning empty group");
    Ok(HostGroup::new(pattern, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{AUTOSCALING_GROUP_TAG, StaticInventory};

    fn server(id: &str, ip: &str, tags: &[(&str, &str)], groups: &[&str]) -> ServerRecord {
        ServerRecord {
            id: id.to_string(),
            public_ip: Some(ip.to_string()),
            dns_name: Some(format!("{id}.example.net")),
            private_dns_name: Some(format!("{id}.internal")),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    fn inventory() -> StaticInventory {
        StaticInventory::new(vec![
            server("i-0000000a", "10.0.0.4", &[("role", "web")], &["frontend"]),
            server("i-0000000b", "10.0.0.2", &[("role", "web")], &["frontend"]),
            server("i-0000000c", "10.0.0.3", &[("role", "db")], &["backend"]),
            server(
                "i-0000000d",
                "10.0.0.1",
                &[("role", "web"), (AUTOSCALING_GROUP_TAG, "web-asg")],
                &["frontend"],
            ),
        ])
    }

    fn resolve_one(pattern: &str, inventory: &StaticInventory) -> HostGroup {
        smol::block_on(async {
            let groups = resolve(&[pattern.to_string()], inventory).await.unwrap();
            groups.into_iter().next().unwrap()
        })
    }

    #[test]
    fn test_ip_literal_wins_first() {
        let group = resolve_one("192.168.1.10", &inventory());
        assert_eq!(group.hosts().len(), 1);
        assert_eq!(group.hosts()[0].read().unwrap().name(), "ip:192.168.1.10");
    }

    #[test]
    fn test_instance_id_resolution() {
        let group = resolve_one("i-0000000b", &inventory());
        assert_eq!(group.hosts().len(), 1);
        assert_eq!(
            group.hosts()[0].read().unwrap().ip(),
            "10.0.0.2".to_string()
        );
    }

    #[test]
    fn test_hostname_needs_a_dot() {
        let group = resolve_one("web1.example.com", &inventory());
        assert_eq!(
            group.hosts()[0].read().unwrap().name(),
            "hostname:web1.example.com"
        );
    }

    #[test]
    fn test_tag_match_resolves_all_carriers() {
        let group = resolve_one("role=web", &inventory());
        assert_eq!(group.hosts().len(), 3);
    }

    #[test]
    fn test_group_membership_is_the_fallback() {
        let group = resolve_one("backend", &inventory());
        assert_eq!(group.hosts().len(), 1);
        assert_eq!(group.hosts()[0].read().unwrap().ip(), "10.0.0.3");
    }

    #[test]
    fn test_unmatched_pattern_yields_empty_group() {
        let group = resolve_one("role=missing", &inventory());
        assert!(group.hosts().is_empty());
        assert_eq!(group.name(), "role=missing");
    }

    #[test]
    fn test_unknown_instance_id_falls_through_to_empty() {
        // matches the instance-id strategy but resolves to nothing, and no
        // later strategy finds a group called "i-deadbeef" either
        let group = resolve_one("i-deadbeef", &inventory());
        assert!(group.hosts().is_empty());
    }

    #[test]
    fn test_servers_without_public_ip_are_skipped() {
        let mut hidden = server("i-00000bad", "0.0.0.0", &[("role", "web")], &[]);
        hidden.public_ip = None;
        let inventory = StaticInventory::new(vec![hidden]);
        let group = resolve_one("role=web", &inventory);
        assert!(group.hosts().is_empty());
    }

    #[test]
    fn test_percent_selection_is_deterministic_and_monotone() {
        let inventory = inventory();
        let half = resolve_one("role=web", &inventory);
        half.install_percent_of_hosts(50);
        let half_names: Vec<String> = half
            .hosts_for_action(HostAction::Install)
            .iter()
            .map(|host| host.read().unwrap().name())
            .collect();
        // ceil(3 * 50%) = 2, lowest IPs first
        assert_eq!(half_names.len(), 2);

        let again = resolve_one("role=web", &inventory);
        again.install_percent_of_hosts(50);
        let again_names: Vec<String> = again
            .hosts_for_action(HostAction::Install)
            .iter()
            .map(|host| host.read().unwrap().name())
            .collect();
        assert_eq!(half_names, again_names);

        let three_quarters = resolve_one("role=web", &inventory);
        three_quarters.install_percent_of_hosts(75);
        let bigger: Vec<String> = three_quarters
            .hosts_for_action(HostAction::Install)
            .iter()
            .map(|host| host.read().unwrap().name())
            .collect();
        assert!(bigger.len() > half_names.len());
        for name in &half_names {
            assert!(bigger.contains(name));
        }
    }

    #[test]
    fn test_count_selection_clamps_to_group_size() {
        let group = resolve_one("role=web", &inventory());
        group.install_number_of_hosts(100);
        assert_eq!(group.hosts_for_action(HostAction::Install).len(), 3);
    }

    #[test]
    fn test_sorted_hosts_orders_by_ip() {
        let group = resolve_one("role=web", &inventory());
        let ips: Vec<String> = group
            .sorted_hosts()
            .iter()
            .map(|host| host.read().unwrap().ip())
            .collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2", "10.0.0.4"]);
    }

    #[test]
    fn test_malformed_ip_resolves_as_hostname() {
        // five octets is not an IP literal, but it does contain a dot
        let inventory = StaticInventory::new(Vec::new());
        let group = resolve_one("10.0.0.1.9", &inventory);
        assert_eq!(
            group.hosts()[0].read().unwrap().name(),
            "hostname:10.0.0.1.9"
        );
    }
}
