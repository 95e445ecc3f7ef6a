use anyhow::{anyhow, Context, Result};
use if_addrs::{get_if_addrs, IfAddr, Interface};
use std::net::Ipv4Addr;

/// Local source for outbound probe connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSource {
    pub interface: String,
    pub addr: Ipv4Addr,
}

/// Resolve an interface name to its first IPv4 address.
///
/// A missing interface, or one without IPv4, is a startup error.
pub fn resolve_interface(name: &str) -> Result<BindSource> {
    let ifaces = get_if_addrs().context("failed to list network interfaces")?;
    select_ipv4(&ifaces, name)
}

fn select_ipv4(ifaces: &[Interface], name: &str) -> Result<BindSource> {
    let mut seen = false;
    for iface in ifaces.iter().filter(|i| i.name == name) {
        seen = true;
        if let IfAddr::V4(v4) = &iface.addr {
            return Ok(BindSource {
                interface: name.to_string(),
                addr: v4.ip,
            });
        }
    }
    if seen {
        Err(anyhow!("interface {name} has no IPv4 address"))
    } else {
        Err(anyhow!("interface {name} not found"))
    }
}
