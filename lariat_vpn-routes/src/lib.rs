//! Policy-based routing engine.
//!
//! Manages the kernel routing state a VPN daemon needs while connected:
//! routes into custom tables ([`router::Router`] over a shell or netlink
//! [`route::RouteAgent`]), the fwmark policy rules that steer unmarked
//! traffic through those tables ([`iprule`], [`policy::PolicyRouter`]),
//! the rp_filter sysctl ([`rpfilter`]) and a kernel-faithful default
//! gateway lookup ([`gateway::GatewayRetriever`]).

use thiserror::Error;

pub mod gateway;
pub mod ipcmd;
pub mod iprule;
pub mod netlink;
pub mod netlink_ops;
pub mod policy;
pub mod route;
pub mod router;
pub mod rpfilter;

#[cfg(test)]
pub(crate) mod mocks;

/// Table id of the kernel main routing table.
pub const MAIN_TABLE_ID: u32 = 254;

/// First table id considered when allocating a custom routing table.
/// Everything at or above 253 is reserved by the kernel, everything the
/// host already uses is discovered at allocation time.
pub const CUSTOM_TABLE_ID_BASE: u32 = 205;

/// Upper bound for custom table id allocation.
pub const CUSTOM_TABLE_ID_MAX: u32 = 60000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("route already exists")]
    RouteExists,
    #[error("route to other destination already exists")]
    RouteToOtherDestinationExists,
    #[error("not found")]
    NotFound,
    #[error("route device is empty")]
    EmptyDevice,
    #[error("fwmark cannot be 0")]
    ZeroFwmark,
    #[error("unable to calculate rule priority id")]
    NoFreeRulePriority,
    #[error("unable to calculate custom table id")]
    NoFreeTableId,
    #[error(transparent)]
    ShellCommand(#[from] lariat_vpn_lib::shell_command_ext::Error),
    #[error(transparent)]
    Netlink(#[from] rtnetlink::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    General(String),
}
