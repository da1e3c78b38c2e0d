use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::str::FromStr;

/// Parse an address or CIDR range. A bare address becomes a host network
/// (/32 or /128).
pub fn parse_network(input: &str) -> Result<IpNetwork, String> {
    let input = input.trim();
    if let Ok(network) = IpNetwork::from_str(input) {
        return Ok(network);
    }

    let addr = IpAddr::from_str(input)
        .map_err(|_| format!("Invalid IP address or CIDR notation: {}", input))?;
    let prefix = if addr.is_ipv4() { 32 } else { 128 };
    IpNetwork::new(addr, prefix).map_err(|e| e.to_string())
}

/// Whether `ip` falls in any of `networks`. Unparseable addresses never match.
pub fn ip_in_networks(ip: &str, networks: &[IpNetwork]) -> bool {
    IpAddr::from_str(ip)
        .map(|addr| networks.iter().any(|network| network.contains(addr)))
        .unwrap_or(false)
}

/// Static networks from configuration, consulted with the dynamic blocklist.
///
/// A non-empty allow list restricts service to its networks; the deny list
/// always wins.
pub struct NetworkFilter {
    allow: Vec<IpNetwork>,
    deny: Vec<IpNetwork>,
    enabled: bool,
}

impl NetworkFilter {
    pub fn new(enabled: bool) -> Self {
        Self {
            allow: Vec::new(),
            deny: Vec::new(),
            enabled,
        }
    }

    pub fn allow(&mut self, ip_or_cidr: &str) -> Result<(), String> {
        self.allow.push(parse_network(ip_or_cidr)?);
        Ok(())
    }

    pub fn deny(&mut self, ip_or_cidr: &str) -> Result<(), String> {
        self.deny.push(parse_network(ip_or_cidr)?);
        Ok(())
    }

    /// `Some(reason)` when `ip` must be refused.
    pub fn refusal(&self, ip: &str) -> Option<String> {
        // "unknown" and other non-addresses have nothing to match
        if !self.enabled || IpAddr::from_str(ip).is_err() {
            return None;
        }

        if ip_in_networks(ip, &self.deny) {
            return Some(format!("{} is in a denied network", ip));
        }
        if !self.allow.is_empty() && !ip_in_networks(ip, &self.allow) {
            return Some(format!("{} is outside the allowed networks", ip));
        }
        None
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn network_count(&self) -> usize {
        self.allow.len() + self.deny.len()
    }
}
