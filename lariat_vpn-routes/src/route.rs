//! Route model shared by both route agent backends.

use async_trait::async_trait;
use cidr::IpCidr;

use std::fmt;
use std::net::IpAddr;

use crate::Error;

/// Address family of a route or rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Flag passed to the `ip` command (`-4` or `-6`).
    pub fn flag(&self) -> &'static str {
        match self {
            Family::V4 => "-4",
            Family::V6 => "-6",
        }
    }

    pub fn of_addr(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn of_cidr(cidr: IpCidr) -> Self {
        match cidr {
            IpCidr::V4(_) => Family::V4,
            IpCidr::V6(_) => Family::V6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "ipv4"),
            Family::V6 => write!(f, "ipv6"),
        }
    }
}

/// Network interface handle, by kernel index and name.
///
/// The shell backend addresses interfaces by name, the netlink backend
/// by index; routes carry both.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Device {
    pub index: u32,
    pub name: String,
}

/// A single route managed by a [`RouteAgent`].
///
/// `subnet` of `None` means the default route; `table_id` of `0` means
/// the main table. Equality covers all fields, so the same destination
/// in a different table is a different route.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Route {
    pub gateway: Option<IpAddr>,
    pub subnet: Option<IpCidr>,
    pub device: Device,
    pub table_id: u32,
}

impl Route {
    /// Family of the route, derived from the subnet, then the gateway.
    /// Routes with neither are treated as IPv4.
    pub fn family(&self) -> Family {
        if let Some(subnet) = self.subnet {
            return Family::of_cidr(subnet);
        }
        if let Some(gateway) = self.gateway {
            return Family::of_addr(gateway);
        }
        Family::V4
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subnet {
            Some(subnet) => write!(f, "{subnet}")?,
            None => write!(f, "default")?,
        }
        if let Some(gateway) = self.gateway {
            write!(f, " via {gateway}")?;
        }
        if !self.device.name.is_empty() {
            write!(f, " dev {}", self.device.name)?;
        }
        if self.table_id != 0 {
            write!(f, " table {}", self.table_id)?;
        }
        Ok(())
    }
}

/// Installs and withdraws routes, tracking what it installed.
///
/// Contract shared by the shell and netlink backends:
/// - adding a route equal to an already tracked one fails with
///   [`Error::RouteExists`] and leaves the tracked set unchanged;
/// - adding a route that already exists in the live table succeeds but
///   is not tracked, so a later [`RouteAgent::flush`] leaves it alone;
/// - an OS-level "file exists" answer surfaces as
///   [`Error::RouteToOtherDestinationExists`];
/// - `flush` deletes every tracked route, treats already-gone routes as
///   success, joins the remaining failures into one error and always
///   clears the tracked set.
#[async_trait]
pub trait RouteAgent: Send {
    async fn add(&mut self, route: &Route) -> Result<(), Error>;
    async fn flush(&mut self) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    use anyhow::Result;

    #[test]
    fn family_prefers_subnet_over_gateway() -> Result<()> {
        let route = Route {
            gateway: Some("fe80::1".parse()?),
            subnet: Some("10.0.0.0/8".parse()?),
            ..Default::default()
        };
        assert_eq!(route.family(), Family::V4);
        Ok(())
    }

    #[test]
    fn family_falls_back_to_gateway_then_v4() -> Result<()> {
        let route = Route {
            gateway: Some("fe80::1".parse()?),
            ..Default::default()
        };
        assert_eq!(route.family(), Family::V6);
        assert_eq!(Route::default().family(), Family::V4);
        Ok(())
    }

    #[test]
    fn equality_includes_table_id() -> Result<()> {
        let route = Route {
            subnet: Some("10.0.0.0/8".parse()?),
            device: Device {
                index: 3,
                name: "eth0".into(),
            },
            ..Default::default()
        };
        let mut other = route.clone();
        other.table_id = 205;
        assert_ne!(route, other);
        Ok(())
    }

    #[test]
    fn display_renders_default_route() -> Result<()> {
        let route = Route {
            gateway: Some("192.168.0.1".parse()?),
            device: Device {
                index: 2,
                name: "wlan0".into(),
            },
            ..Default::default()
        };
        assert_eq!(route.to_string(), "default via 192.168.0.1 dev wlan0");
        Ok(())
    }
}
