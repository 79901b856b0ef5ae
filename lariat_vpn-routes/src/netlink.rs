//! Route agent backed by netlink.
//!
//! Preferred backend; same [`RouteAgent`] contract as
//! [`crate::ipcmd::IpCmdRouteAgent`] but driven through [`NetlinkOps`]
//! instead of the `ip` binary.

use async_trait::async_trait;

use crate::netlink_ops::{NetlinkOps, RouteSpec};
use crate::route::{Route, RouteAgent};
use crate::Error;

pub struct NetlinkRouteAgent<O: NetlinkOps> {
    ops: O,
    applied: Vec<Route>,
}

impl<O: NetlinkOps> NetlinkRouteAgent<O> {
    pub fn new(ops: O) -> Self {
        Self {
            ops,
            applied: Vec::new(),
        }
    }
}

/// Whether a live route occupies the destination `spec` is about to
/// claim: same destination and either the same gateway or the same
/// output interface.
fn same_live_route(live: &RouteSpec, spec: &RouteSpec) -> bool {
    if live.destination != spec.destination {
        return false;
    }
    if spec.gateway.is_some() && live.gateway == spec.gateway {
        return true;
    }
    spec.if_index != 0 && live.if_index == spec.if_index
}

#[async_trait]
impl<O: NetlinkOps> RouteAgent for NetlinkRouteAgent<O> {
    async fn add(&mut self, route: &Route) -> Result<(), Error> {
        if route.device.index == 0 && route.device.name.is_empty() {
            return Err(Error::EmptyDevice);
        }
        if self.applied.contains(route) {
            return Err(Error::RouteExists);
        }

        let spec = RouteSpec::from_route(route);
        let live = self.ops.route_list(spec.family, Some(spec.table)).await?;
        if live.iter().any(|r| same_live_route(r, &spec)) {
            tracing::debug!(%route, "route already present, not tracking");
            return Ok(());
        }

        self.ops.route_add(&spec).await?;
        self.applied.push(route.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Error> {
        let routes = std::mem::take(&mut self.applied);
        let mut failures = Vec::new();

        for route in routes {
            let spec = RouteSpec::from_route(&route);
            match self.ops.route_del(&spec).await {
                Ok(()) => {}
                Err(Error::NotFound) => {
                    tracing::debug!(%route, "route already gone");
                }
                Err(err) => failures.push(format!("deleting route '{route}': {err}")),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::General(failures.join("; ")))
        }
    }
}
