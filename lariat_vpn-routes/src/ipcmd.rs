//! Route agent backed by the `ip` command.
//!
//! Fallback backend for hosts where the netlink socket is unavailable
//! to the daemon; behavior matches [`crate::netlink::NetlinkRouteAgent`].

use async_trait::async_trait;
use cidr::IpCidr;
use tokio::process::Command;

use lariat_vpn_lib::shell_command_ext::{Logs, ShellCommandExt};

use crate::route::{Route, RouteAgent};
use crate::Error;

const IP_CMD: &str = "ip";

/// [`RouteAgent`] that shells out to `ip route`.
#[derive(Debug, Default)]
pub struct IpCmdRouteAgent {
    applied: Vec<Route>,
}

impl IpCmdRouteAgent {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RouteAgent for IpCmdRouteAgent {
    async fn add(&mut self, route: &Route) -> Result<(), Error> {
        if route.device.name.is_empty() {
            return Err(Error::EmptyDevice);
        }
        if self.applied.contains(route) {
            return Err(Error::RouteExists);
        }

        let listing = Command::new(IP_CMD)
            .args(show_args(route))
            .run_stdout(Logs::Suppress)
            .await?;
        if exists_in_output(&listing, route) {
            // Route was there before us, leave its lifecycle to whoever
            // installed it.
            tracing::debug!(%route, "route already present, not tracking");
            return Ok(());
        }

        let out = Command::new(IP_CMD).args(route_args(route, "add")?).run_combined().await?;
        if !out.success {
            if out.combined.contains("File exists") {
                return Err(Error::RouteToOtherDestinationExists);
            }
            return Err(Error::General(format!(
                "adding route '{route}': {}",
                out.combined.trim()
            )));
        }

        self.applied.push(route.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Error> {
        let routes = std::mem::take(&mut self.applied);
        let mut failures = Vec::new();

        for route in routes {
            let args = match route_args(&route, "delete") {
                Ok(args) => args,
                Err(err) => {
                    failures.push(format!("deleting route '{route}': {err}"));
                    continue;
                }
            };
            match Command::new(IP_CMD).args(args).run_combined().await {
                Ok(out) if out.success => {}
                Ok(out) if out.combined.contains("No such process") => {
                    tracing::debug!(%route, "route already gone");
                }
                Ok(out) => failures.push(format!("deleting route '{route}': {}", out.combined.trim())),
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

/// Arguments for `ip ... route {add|delete} ...`.
///
/// Four shapes depending on which parts the route carries:
/// interface only, default via gateway, subnet via interface, and
/// subnet via gateway.
fn route_args(route: &Route, operation: &str) -> Result<Vec<String>, Error> {
    if route.device.name.is_empty() {
        return Err(Error::EmptyDevice);
    }

    let mut args = vec![
        route.family().flag().to_string(),
        "route".to_string(),
        operation.to_string(),
    ];
    if route.table_id != 0 {
        args.push("table".to_string());
        args.push(route.table_id.to_string());
    }
    match (route.subnet, route.gateway) {
        (Some(subnet), Some(gateway)) => {
            args.push(route_match_string(subnet));
            args.push("via".to_string());
            args.push(gateway.to_string());
        }
        (None, Some(gateway)) => {
            args.push("default".to_string());
            args.push("via".to_string());
            args.push(gateway.to_string());
        }
        (Some(subnet), None) => {
            args.push(route_match_string(subnet));
        }
        (None, None) => {}
    }
    args.push("dev".to_string());
    args.push(route.device.name.clone());
    Ok(args)
}

/// Arguments for the `ip route show` listing consulted before an add.
fn show_args(route: &Route) -> Vec<String> {
    let mut args = vec![
        route.family().flag().to_string(),
        "route".to_string(),
        "show".to_string(),
    ];
    if route.table_id != 0 {
        args.push("table".to_string());
        args.push(route.table_id.to_string());
    }
    args
}

/// How `ip route` prints the destination of a route: `default` for the
/// zero prefix, the bare address for host prefixes (the cidr crate's
/// Display already drops the full-length suffix), CIDR otherwise.
fn route_match_string(subnet: IpCidr) -> String {
    if subnet.network_length() == 0 {
        "default".to_string()
    } else {
        subnet.to_string()
    }
}

/// Whether `ip route show` output already lists this route.
///
/// A line counts as a match when it starts with the route's destination
/// and mentions its gateway, or its device when the gateway does not
/// appear. Routes without a subnet are never treated as pre-existing.
fn exists_in_output(output: &str, route: &Route) -> bool {
    let Some(subnet) = route.subnet else {
        return false;
    };
    let needle = route_match_string(subnet);
    for line in output.lines() {
        if !line.starts_with(&needle) {
            continue;
        }
        if let Some(gateway) = route.gateway {
            if line.contains(&gateway.to_string()) {
                return true;
            }
        }
        if !route.device.name.is_empty() && line.contains(&route.device.name) {
            return true;
        }
    }
    false
}
