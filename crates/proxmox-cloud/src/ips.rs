//! Guest IP extraction from VM configuration.
//!
//! Containers carry addresses in `netN` entries, full VMs in `ipconfigN`
//! (cloud-init) entries. Both are comma separated `key=value` lists whose
//! `ip` entry is a CIDR interface address.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde_json::Value;
use thiserror::Error;
use tracing::error;

use crate::api::Technology;
use crate::params::Params;

/// A stringlist item that is not a single `key=value` pair.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid setting '{0}' (expected key=value)")]
pub struct InvalidSetting(pub String);

/// IPv4 ranges treated as private (IANA special-purpose, not globally reachable).
static PRIVATE_V4: LazyLock<Vec<Ipv4Net>> = LazyLock::new(|| {
    [
        "0.0.0.0/8",
        "10.0.0.0/8",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "172.16.0.0/12",
        "192.0.0.0/29",
        "192.0.0.170/31",
        "192.0.2.0/24",
        "192.168.0.0/16",
        "198.18.0.0/15",
        "198.51.100.0/24",
        "203.0.113.0/24",
        "240.0.0.0/4",
        "255.255.255.255/32",
    ]
    .iter()
    .filter_map(|net| net.parse().ok())
    .collect()
});

/// IPv6 ranges treated as private.
static PRIVATE_V6: LazyLock<Vec<Ipv6Net>> = LazyLock::new(|| {
    [
        "::1/128",
        "::/128",
        "::ffff:0:0/96",
        "64:ff9b:1::/48",
        "100::/64",
        "2001::/23",
        "2001:db8::/32",
        "2001:10::/28",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .filter_map(|net| net.parse().ok())
    .collect()
});

/// Convert `setting1=value1,setting2=value2` into a map.
///
/// Empty items are skipped and whitespace around each item is trimmed;
/// whitespace inside keys and values is kept.
///
/// # Errors
/// Returns `InvalidSetting` for an item without exactly one `=`.
pub fn stringlist_to_map(input: &str) -> Result<BTreeMap<String, String>, InvalidSetting> {
    input
        .split(',')
        .filter(|item| !item.is_empty())
        .map(|item| {
            let item = item.trim();
            let mut parts = item.split('=');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) => Ok((key.to_string(), value.to_string())),
                _ => Err(InvalidSetting(item.to_string())),
            }
        })
        .collect()
}

/// Whether an address falls in a private or otherwise non-global range.
#[must_use]
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    PRIVATE_V4.iter().any(|net| net.contains(&ip))
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    PRIVATE_V6.iter().any(|net| net.contains(&ip))
}

/// Extract the `ip` address from one network config string.
fn address_of(config: &str) -> Result<IpAddr, String> {
    let settings = stringlist_to_map(config).map_err(|e| e.to_string())?;
    let ip = settings
        .get("ip")
        .ok_or_else(|| "no ip setting".to_string())?;

    ip.parse::<IpNet>()
        .map(|net| net.addr())
        .or_else(|_| ip.parse::<IpAddr>())
        .map_err(|_| ip.clone())
}

/// Split the addresses in a VM config into private and public lists.
///
/// Malformed entries (missing `ip`, `dhcp`, invalid addresses) are logged
/// and skipped.
#[must_use]
pub fn parse_ips(config: &Params, technology: Technology) -> (Vec<String>, Vec<String>) {
    let prefix = technology.ip_config_prefix();
    let mut private_ips = Vec::new();
    let mut public_ips = Vec::new();

    for (key, value) in config.iter().filter(|(key, _)| key.starts_with(prefix)) {
        let Value::String(ip_config) = value else {
            continue;
        };

        match address_of(ip_config) {
            Ok(ip) if is_private(ip) => private_ips.push(ip.to_string()),
            Ok(ip) => public_ips.push(ip.to_string()),
            Err(invalid) => {
                error!(key = %key, value = %invalid, "Ignoring entry because it is not a valid IP");
            }
        }
    }

    (private_ips, public_ips)
}
