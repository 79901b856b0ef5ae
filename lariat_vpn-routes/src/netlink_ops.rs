//! Abstraction over rtnetlink operations for testability.
//!
//! Defines [`NetlinkOps`] and domain types ([`RouteSpec`], [`RuleSpec`],
//! [`LinkInfo`]) that decouple rule allocation and gateway selection
//! from the raw netlink wire format.
//!
//! Production code uses [`RealNetlinkOps`] which wraps `rtnetlink::Handle`.
//! Tests use stateful mocks (see `mocks` module).

use async_trait::async_trait;
use cidr::IpCidr;
use futures::TryStreamExt;
use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute, RuleFlags, RuleMessage};
use rtnetlink::{IpVersion, RouteMessageBuilder};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::route::Family;
use crate::{Error, MAIN_TABLE_ID};

// ============================================================================
// Domain Types
// ============================================================================

/// Route specification decoupled from the rtnetlink wire format.
///
/// `destination` of `None` is the default route of the given family
/// (it covers every address).
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub family: Family,
    pub destination: Option<IpCidr>,
    pub gateway: Option<IpAddr>,
    pub if_index: u32,
    pub table: u32,
    pub metric: u32,
}

/// Policy routing rule specification.
///
/// `priority` of `None` means the kernel reported no explicit priority
/// (the implicit rules at priority 0 do this).
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSpec {
    pub family: Family,
    pub priority: Option<u32>,
    pub invert: bool,
    pub fw_mark: Option<u32>,
    pub table: u32,
    pub src: Option<IpCidr>,
    pub suppress_prefix_len: Option<u32>,
    pub suppress_if_group: Option<u32>,
}

impl RuleSpec {
    /// Rule with only family and table set, the base for the rules this
    /// crate installs.
    pub fn to_table(family: Family, table: u32) -> Self {
        Self {
            family,
            priority: None,
            invert: false,
            fw_mark: None,
            table,
            src: None,
            suppress_prefix_len: None,
            suppress_if_group: None,
        }
    }
}

/// Network link (interface) information.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub group: u32,
}

/// Rule identity comparison used for deletion and lookup.
///
/// Priority is deliberately ignored so a rule installed in an earlier
/// run (at whatever priority was free then) is still recognized.
pub fn rule_matches(candidate: &RuleSpec, want: &RuleSpec) -> bool {
    candidate.family == want.family
        && candidate.invert == want.invert
        && candidate.fw_mark == want.fw_mark
        && candidate.table == want.table
        && candidate.suppress_prefix_len == want.suppress_prefix_len
}

// ============================================================================
// Trait
// ============================================================================

/// Abstraction over netlink route/rule/link operations.
///
/// Implementors must be cheaply cloneable (e.g. via `Arc` or because the
/// underlying handle is already reference-counted).
#[async_trait]
pub trait NetlinkOps: Send + Sync + Clone {
    /// Adds a route. An identical destination already present in the
    /// same table surfaces as [`Error::RouteToOtherDestinationExists`].
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error>;
    /// Deletes a route. A route the kernel no longer has surfaces as
    /// [`Error::NotFound`].
    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error>;
    /// Lists routes of one family, optionally filtered by table id.
    /// `None` returns routes from every table.
    async fn route_list(&self, family: Family, table: Option<u32>) -> Result<Vec<RouteSpec>, Error>;

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error>;
    /// Deletes the first rule matching `rule` per [`rule_matches`].
    /// [`Error::NotFound`] if nothing matches.
    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error>;
    async fn rule_list(&self, family: Family) -> Result<Vec<RuleSpec>, Error>;

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error>;
}

// ============================================================================
// Real Implementation
// ============================================================================

/// Production [`NetlinkOps`] backed by an `rtnetlink::Handle`.
#[derive(Clone)]
pub struct RealNetlinkOps {
    handle: rtnetlink::Handle,
}

impl RealNetlinkOps {
    pub fn new(handle: rtnetlink::Handle) -> Self {
        Self { handle }
    }

    /// Expose the underlying handle for callers that need direct access
    /// (e.g. main.rs spawning the connection task).
    pub fn handle(&self) -> &rtnetlink::Handle {
        &self.handle
    }

    fn build_route_message(spec: &RouteSpec) -> RouteMessage {
        match spec.family {
            Family::V4 => {
                let mut builder = RouteMessageBuilder::<Ipv4Addr>::default()
                    .output_interface(spec.if_index)
                    .table_id(spec.table);
                if let Some(IpCidr::V4(dst)) = spec.destination {
                    builder = builder.destination_prefix(dst.first_address(), dst.network_length());
                }
                if let Some(IpAddr::V4(gw)) = spec.gateway {
                    builder = builder.gateway(gw);
                }
                builder.build()
            }
            Family::V6 => {
                let mut builder = RouteMessageBuilder::<Ipv6Addr>::default()
                    .output_interface(spec.if_index)
                    .table_id(spec.table);
                if let Some(IpCidr::V6(dst)) = spec.destination {
                    builder = builder.destination_prefix(dst.first_address(), dst.network_length());
                }
                if let Some(IpAddr::V6(gw)) = spec.gateway {
                    builder = builder.gateway(gw);
                }
                builder.build()
            }
        }
    }

    fn route_message_to_spec(family: Family, msg: &RouteMessage) -> RouteSpec {
        let destination_addr = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
            RouteAttribute::Destination(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        });
        let destination = destination_addr
            .and_then(|ip| IpCidr::new(ip, msg.header.destination_prefix_length).ok());

        let gateway = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
            RouteAttribute::Gateway(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        });

        let if_index = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Oif(idx) => Some(*idx),
                _ => None,
            })
            .unwrap_or(0);

        let table = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Table(id) => Some(*id),
                _ => None,
            })
            .unwrap_or(msg.header.table as u32);

        let metric = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Priority(metric) => Some(*metric),
                _ => None,
            })
            .unwrap_or(0);

        RouteSpec {
            family,
            destination,
            gateway,
            if_index,
            table,
            metric,
        }
    }

    fn rule_message_to_spec(family: Family, msg: &RuleMessage) -> RuleSpec {
        let priority = msg.attributes.iter().find_map(|a| match a {
            RuleAttribute::Priority(p) => Some(*p),
            _ => None,
        });
        let fw_mark = msg.attributes.iter().find_map(|a| match a {
            RuleAttribute::FwMark(m) => Some(*m),
            _ => None,
        });
        let table = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RuleAttribute::Table(t) => Some(*t),
                _ => None,
            })
            .unwrap_or(msg.header.table as u32);
        let src = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RuleAttribute::Source(ip) => Some(*ip),
                _ => None,
            })
            .and_then(|ip| IpCidr::new(ip, msg.header.src_len).ok());
        let suppress_prefix_len = msg.attributes.iter().find_map(|a| match a {
            RuleAttribute::SuppressPrefixLen(len) => Some(*len),
            _ => None,
        });
        let suppress_if_group = msg.attributes.iter().find_map(|a| match a {
            RuleAttribute::SuppressIfGroup(group) => Some(*group),
            _ => None,
        });

        RuleSpec {
            family,
            priority,
            invert: msg.header.flags.contains(RuleFlags::Invert),
            fw_mark,
            table,
            src,
            suppress_prefix_len,
            suppress_if_group,
        }
    }

    fn map_netlink_err(err: rtnetlink::Error) -> Error {
        if let rtnetlink::Error::NetlinkError(ref msg) = err {
            match msg.raw_code() {
                code if code == -libc::EEXIST => return Error::RouteToOtherDestinationExists,
                code if code == -libc::ESRCH || code == -libc::ENOENT => return Error::NotFound,
                _ => {}
            }
        }
        Error::Netlink(err)
    }
}

fn ip_version(family: Family) -> IpVersion {
    match family {
        Family::V4 => IpVersion::V4,
        Family::V6 => IpVersion::V6,
    }
}

async fn execute_rule_add<T: Send + 'static>(
    mut req: rtnetlink::RuleAddRequest<T>,
    rule: &RuleSpec,
) -> Result<(), Error> {
    req = req.table_id(rule.table).action(RuleAction::ToTable);
    if let Some(priority) = rule.priority {
        req = req.priority(priority);
    }
    if let Some(mark) = rule.fw_mark {
        req = req.fw_mark(mark);
    }
    if rule.invert {
        req.message_mut().header.flags.insert(RuleFlags::Invert);
    }
    if let Some(len) = rule.suppress_prefix_len {
        req.message_mut()
            .attributes
            .push(RuleAttribute::SuppressPrefixLen(len));
    }
    req.execute().await.map_err(RealNetlinkOps::map_netlink_err)
}

#[async_trait]
impl NetlinkOps for RealNetlinkOps {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route);
        self.handle
            .route()
            .add(msg)
            .execute()
            .await
            .map_err(Self::map_netlink_err)
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_route_message(route);
        self.handle
            .route()
            .del(msg)
            .execute()
            .await
            .map_err(Self::map_netlink_err)
    }

    async fn route_list(&self, family: Family, table: Option<u32>) -> Result<Vec<RouteSpec>, Error> {
        // The kernel dump covers every table; filtering happens here so
        // `None` and `Some` requests share one code path.
        let msg = match family {
            Family::V4 => RouteMessageBuilder::<Ipv4Addr>::default().build(),
            Family::V6 => RouteMessageBuilder::<Ipv6Addr>::default().build(),
        };
        let routes: Vec<_> = self.handle.route().get(msg).execute().try_collect().await?;

        Ok(routes
            .iter()
            .map(|msg| Self::route_message_to_spec(family, msg))
            .filter(|spec| table.is_none_or(|id| spec.table == id))
            .collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        match rule.family {
            Family::V4 => execute_rule_add(self.handle.rule().add().v4(), rule).await,
            Family::V6 => execute_rule_add(self.handle.rule().add().v6(), rule).await,
        }
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        let msgs: Vec<_> = self
            .handle
            .rule()
            .get(ip_version(rule.family))
            .execute()
            .try_collect()
            .await?;

        for msg in msgs {
            let spec = Self::rule_message_to_spec(rule.family, &msg);
            if rule_matches(&spec, rule) {
                return self
                    .handle
                    .rule()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(Self::map_netlink_err);
            }
        }

        Err(Error::NotFound)
    }

    async fn rule_list(&self, family: Family) -> Result<Vec<RuleSpec>, Error> {
        let msgs: Vec<_> = self
            .handle
            .rule()
            .get(ip_version(family))
            .execute()
            .try_collect()
            .await?;

        Ok(msgs
            .iter()
            .map(|msg| Self::rule_message_to_spec(family, msg))
            .collect())
    }

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        let links: Vec<_> = self.handle.link().get().execute().try_collect().await?;

        Ok(links
            .iter()
            .filter_map(|link| {
                let name = link.attributes.iter().find_map(|a| match a {
                    LinkAttribute::IfName(n) => Some(n.clone()),
                    _ => None,
                })?;
                let group = link
                    .attributes
                    .iter()
                    .find_map(|a| match a {
                        LinkAttribute::Group(g) => Some(*g),
                        _ => None,
                    })
                    .unwrap_or(0);
                Some(LinkInfo {
                    index: link.header.index,
                    name,
                    group,
                })
            })
            .collect())
    }
}

impl RouteSpec {
    /// Spec for a [`crate::route::Route`], with table id 0 normalized to
    /// the main table.
    pub fn from_route(route: &crate::route::Route) -> Self {
        Self {
            family: route.family(),
            destination: route.subnet,
            gateway: route.gateway,
            if_index: route.device.index,
            table: if route.table_id == 0 {
                MAIN_TABLE_ID
            } else {
                route.table_id
            },
            metric: 0,
        }
    }
}
