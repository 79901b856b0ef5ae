//! Default gateway lookup.
//!
//! Emulates the kernel's route selection instead of trusting the first
//! default route: candidate routes are filtered, sorted by specificity,
//! then re-ordered by the policy rules that apply to them, and the first
//! one with a gateway wins. This keeps the answer correct while our own
//! rules and tables are installed, which is exactly when the daemon
//! needs it (the tunnel's own table is passed as `ignore_table`).

use cidr::IpCidr;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::IpAddr;

use crate::netlink_ops::{LinkInfo, NetlinkOps, RouteSpec, RuleSpec};
use crate::route::Family;
use crate::Error;

/// Read-only gateway lookup over [`NetlinkOps`].
pub struct GatewayRetriever<O: NetlinkOps> {
    ops: O,
}

impl<O: NetlinkOps> GatewayRetriever<O> {
    pub fn new(ops: O) -> Self {
        Self { ops }
    }

    /// Gateway and interface a packet toward `prefix` would use,
    /// ignoring routes in `ignore_table`. [`Error::NotFound`] when no
    /// matching route carries a gateway.
    pub async fn retrieve(&self, prefix: IpCidr, ignore_table: u32) -> Result<(IpAddr, LinkInfo), Error> {
        let family = Family::of_cidr(prefix);
        let mut candidates = self.ops.route_list(family, None).await?;
        candidates.retain(|r| r.table != ignore_table && covers(r.destination, Some(prefix)));
        if candidates.is_empty() {
            return Err(Error::NotFound);
        }

        let links = self.ops.link_list().await?;
        if candidates.len() > 1 {
            candidates.sort_by(route_cmp);
            let mut rules = self.ops.rule_list(family).await?;
            rules.sort_by_key(|r| r.priority.unwrap_or(0));
            candidates = order_routes_by_rules(&rules, candidates, &links);
        }

        let (gateway, if_index) = candidates
            .into_iter()
            .find_map(|r| r.gateway.map(|gw| (gw, r.if_index)))
            .ok_or(Error::NotFound)?;
        let link = links
            .into_iter()
            .find(|l| l.index == if_index)
            .ok_or_else(|| Error::General(format!("interface with index {if_index} not found")))?;
        Ok((gateway, link))
    }
}

/// Whether `network` contains the whole of `subnet`. A missing network
/// is the zero prefix and contains everything; a missing subnet is
/// contained by nothing but that.
fn covers(network: Option<IpCidr>, subnet: Option<IpCidr>) -> bool {
    let Some(network) = network else {
        return true;
    };
    let Some(subnet) = subnet else {
        return false;
    };
    network.contains(&subnet.first_address()) && network.network_length() <= subnet.network_length()
}

/// More specific first, lower metric first.
fn route_cmp(a: &RouteSpec, b: &RouteSpec) -> Ordering {
    let a_len = a.destination.map_or(0, |d| d.network_length());
    let b_len = b.destination.map_or(0, |d| d.network_length());
    b_len.cmp(&a_len).then(a.metric.cmp(&b.metric))
}

/// Whether a rule applies to a route.
///
/// The base conditions: the rule carries no fwmark (routes know nothing
/// about marks, so marked rules can never be assumed to match), points
/// at the route's table, its source covers the route's destination, its
/// suppress_prefixlength (if any) is strictly below the route's prefix
/// length, and its suppress_ifgroup (if any) differs from the route's
/// interface group. Inverted rules apply exactly when the base
/// conditions fail.
fn rule_applies_for_route(rule: &RuleSpec, route: &RouteSpec, ifgroup: u32) -> bool {
    let route_prefix_len = u32::from(route.destination.map_or(0, |d| d.network_length()));
    let applies = rule.fw_mark.is_none()
        && rule.table == route.table
        && covers(rule.src, route.destination)
        && rule.suppress_prefix_len.is_none_or(|len| len < route_prefix_len)
        && rule.suppress_if_group.is_none_or(|group| group != ifgroup);
    rule.invert != applies
}

/// Groups routes by the first rule (in priority order) that applies to
/// them and concatenates the groups; routes inside one group keep their
/// incoming order. Routes no rule applies to are dropped.
fn order_routes_by_rules(rules: &[RuleSpec], routes: Vec<RouteSpec>, links: &[LinkInfo]) -> Vec<RouteSpec> {
    let groups: HashMap<u32, u32> = links.iter().map(|l| (l.index, l.group)).collect();
    let mut used = vec![false; routes.len()];
    let mut out = Vec::new();
    for rule in rules {
        for (i, route) in routes.iter().enumerate() {
            let ifgroup = groups.get(&route.if_index).copied().unwrap_or(0);
            if !used[i] && rule_applies_for_route(rule, route, ifgroup) {
                used[i] = true;
                out.push(route.clone());
            }
        }
    }
    out
}
