//! Network interface selection.
//!
//! mDNS is link-local; answering or querying through VPN tunnels and
//! container bridges leaks traffic off the link and is a privacy defect, so
//! the default policy filters those out by name prefix. Callers can pin an
//! explicit interface list or supply their own predicate instead.

use std::net::Ipv4Addr;
use std::sync::Arc;

use get_if_addrs::{get_if_addrs, IfAddr, Interface};
use log::debug;

use crate::error::{Error, Result};

/// User-supplied interface predicate.
pub type InterfaceFilter = Arc<dyn Fn(&Interface) -> bool + Send + Sync>;

/// Name prefixes of tunnel and virtual interfaces the default policy skips.
const VIRTUAL_PREFIXES: &[&str] = &[
    "utun",
    "tun",
    "ppp",
    "wg",
    "tailscale",
    "wireguard",
    "docker0",
    "veth",
    "br-",
];

/// The IPv4 address of an interface entry, if it has one.
pub fn ipv4(iface: &Interface) -> Option<Ipv4Addr> {
    match iface.addr {
        IfAddr::V4(ref v4) => Some(v4.ip),
        IfAddr::V6(_) => None,
    }
}

/// The default policy: keep interfaces that carry an IPv4 address, are not
/// loopback, and do not look like tunnels or virtual bridges.
pub fn default_policy(iface: &Interface) -> bool {
    if ipv4(iface).is_none() || iface.is_loopback() {
        return false;
    }
    !VIRTUAL_PREFIXES
        .iter()
        .any(|prefix| iface.name.starts_with(prefix))
}

/// Resolves the interface set to operate on.
///
/// An explicit name list wins over a predicate, which wins over the default
/// policy. Explicitly listed interfaces are taken as-is (loopback included,
/// which is what tests want); they only need an IPv4 address.
pub fn select(
    explicit: Option<&[String]>,
    filter: Option<&InterfaceFilter>,
) -> Result<Vec<Interface>> {
    let all = get_if_addrs().map_err(|e| Error::network("list-interfaces", e))?;

    let selected: Vec<Interface> = match (explicit, filter) {
        (Some(names), _) => {
            if names.is_empty() {
                return Err(Error::validation(
                    "interfaces",
                    "[]",
                    "explicit interface list is empty",
                ));
            }
            all.into_iter()
                .filter(|iface| ipv4(iface).is_some() && names.iter().any(|n| *n == iface.name))
                .collect()
        }
        (None, Some(filter)) => {
            let filter = filter.as_ref();
            all.into_iter()
                .filter(|iface| ipv4(iface).is_some() && filter(iface))
                .collect()
        }
        (None, None) => all.into_iter().filter(default_policy).collect(),
    };

    if selected.is_empty() {
        return Err(Error::validation(
            "interfaces",
            "selection",
            "no usable IPv4 multicast interface",
        ));
    }
    for iface in &selected {
        debug!("selected interface {} ({:?})", iface.name, ipv4(iface));
    }
    Ok(selected)
}

/// The distinct IPv4 addresses of a selection, for group joins and A
/// records.
pub fn addresses(interfaces: &[Interface]) -> Vec<Ipv4Addr> {
    let mut addrs: Vec<Ipv4Addr> = interfaces.iter().filter_map(ipv4).collect();
    addrs.sort_by_key(|a| a.octets());
    addrs.dedup();
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use get_if_addrs::Ifv4Addr;

    fn iface(name: &str, ip: Ipv4Addr) -> Interface {
        Interface {
            name: name.to_owned(),
            addr: IfAddr::V4(Ifv4Addr {
                ip,
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                broadcast: None,
            }),
        }
    }

    #[test]
    fn default_policy_skips_virtual_interfaces() {
        for name in &[
            "utun0",
            "tun1",
            "ppp0",
            "wg0",
            "tailscale0",
            "wireguard1",
            "docker0",
            "veth12ab",
            "br-4f2a",
        ] {
            assert!(
                !default_policy(&iface(name, Ipv4Addr::new(10, 0, 0, 2))),
                "{} passed the policy",
                name
            );
        }
        assert!(default_policy(&iface("eth0", Ipv4Addr::new(192, 168, 1, 5))));
        assert!(default_policy(&iface("en0", Ipv4Addr::new(10, 1, 2, 3))));
    }

    #[test]
    fn default_policy_skips_loopback() {
        assert!(!default_policy(&iface("lo", Ipv4Addr::new(127, 0, 0, 1))));
    }

    #[test]
    fn empty_explicit_list_is_a_validation_error() {
        match select(Some(&[]), None) {
            Err(Error::Validation { field, .. }) => assert_eq!(field, "interfaces"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn addresses_dedups() {
        let list = vec![
            iface("eth0", Ipv4Addr::new(10, 0, 0, 2)),
            iface("eth0:1", Ipv4Addr::new(10, 0, 0, 2)),
            iface("eth1", Ipv4Addr::new(192, 168, 1, 9)),
        ];
        assert_eq!(
            addresses(&list),
            vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(192, 168, 1, 9)]
        );
    }
}
