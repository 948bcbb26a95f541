//! # Subnet Locality Routing
//!
//! Purpose: Decide whether a cache server hostname is reachable on a
//! locally-attached subnet, so the client can prefer nearby cluster members.
//!
//! ## Design Principles
//! 1. **Snapshot Once**: Local interfaces are enumerated on first use and
//!    cached for the router's lifetime; refresh means a new router.
//! 2. **Fail Open**: Resolution problems classify a host as "not local" and
//!    are logged, never raised to the caller.
//! 3. **Explicit Dependency**: The router is a constructed, injectable value,
//!    not a process-wide singleton.
//! 4. **Plain Arithmetic**: Subnet membership is a masked compare over a
//!    handful of interfaces and addresses; a linear scan is enough.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::OnceLock;

use tracing::warn;

use crate::client::{CacheError, CacheResult};

/// One local network interface with its IPv4 address and netmask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub addr: Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl Interface {
    /// True when `addr` falls inside this interface's subnet.
    fn covers(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::from(self.mask);
        (u32::from(addr) & mask) == (u32::from(self.addr) & mask)
    }
}

/// Classifies hostnames as local or remote by subnet membership.
pub struct SubnetRouter {
    interfaces: OnceLock<Vec<Interface>>,
}

impl SubnetRouter {
    /// Router backed by the machine's interfaces, enumerated lazily on first
    /// use.
    pub fn new() -> Self {
        SubnetRouter {
            interfaces: OnceLock::new(),
        }
    }

    /// Router backed by an injected interface snapshot.
    pub fn with_interfaces(interfaces: Vec<Interface>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(interfaces);
        SubnetRouter { interfaces: cell }
    }

    /// True when `host` resolves to at least one address that shares a subnet
    /// with a local interface. Unresolvable hosts are reported as not local.
    pub fn is_local(&self, host: &str) -> bool {
        let interfaces = self.snapshot();

        let endpoint = match resolve(host) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!("cannot classify host {host}: {err}");
                return false;
            }
        };

        endpoint
            .iter()
            .any(|addr| interfaces.iter().any(|ifc| ifc.covers(*addr)))
    }

    fn snapshot(&self) -> &[Interface] {
        self.interfaces.get_or_init(enumerate_interfaces)
    }
}

impl Default for SubnetRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn enumerate_interfaces() -> Vec<Interface> {
    match if_addrs::get_if_addrs() {
        Ok(addrs) => addrs
            .into_iter()
            .filter_map(|ifa| match ifa.addr {
                if_addrs::IfAddr::V4(v4) => Some(Interface {
                    name: ifa.name,
                    addr: v4.ip,
                    mask: v4.netmask,
                }),
                if_addrs::IfAddr::V6(_) => None,
            })
            .collect(),
        Err(err) => {
            warn!("failed to enumerate network interfaces: {err}");
            Vec::new()
        }
    }
}

/// Resolves `host` (literal or DNS name) to its IPv4 addresses.
fn resolve(host: &str) -> CacheResult<Vec<Ipv4Addr>> {
    let addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(|_| CacheError::Unroutable {
            host: host.to_string(),
        })?;

    let endpoint: Vec<Ipv4Addr> = addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .collect();

    if endpoint.is_empty() {
        return Err(CacheError::Unroutable {
            host: host.to_string(),
        });
    }

    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_10_0_0_5_slash_24() -> SubnetRouter {
        SubnetRouter::with_interfaces(vec![Interface {
            name: "eth0".to_string(),
            addr: Ipv4Addr::new(10, 0, 0, 5),
            mask: Ipv4Addr::new(255, 255, 255, 0),
        }])
    }

    #[test]
    fn same_subnet_is_local() {
        let router = router_10_0_0_5_slash_24();
        assert!(router.is_local("10.0.0.77"));
    }

    #[test]
    fn other_subnet_is_remote() {
        let router = router_10_0_0_5_slash_24();
        assert!(!router.is_local("10.0.1.77"));
        assert!(!router.is_local("192.168.1.1"));
    }

    #[test]
    fn unresolvable_host_is_remote_without_panicking() {
        let router = router_10_0_0_5_slash_24();
        assert!(!router.is_local("host.that.does.not.exist.invalid"));
    }

    #[test]
    fn any_matching_interface_wins() {
        let router = SubnetRouter::with_interfaces(vec![
            Interface {
                name: "eth0".to_string(),
                addr: Ipv4Addr::new(10, 0, 0, 5),
                mask: Ipv4Addr::new(255, 255, 255, 0),
            },
            Interface {
                name: "eth1".to_string(),
                addr: Ipv4Addr::new(172, 16, 4, 1),
                mask: Ipv4Addr::new(255, 255, 0, 0),
            },
        ]);
        assert!(router.is_local("172.16.200.9"));
    }

    #[test]
    fn empty_snapshot_classifies_everything_remote() {
        let router = SubnetRouter::with_interfaces(Vec::new());
        assert!(!router.is_local("10.0.0.77"));
    }

    #[test]
    fn machine_enumeration_does_not_panic() {
        let router = SubnetRouter::new();
        let _ = router.is_local("127.0.0.1");
    }
}
