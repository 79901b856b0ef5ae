//! Stateful mocks for routing trait abstractions.
//!
//! These mocks track actual state (routes, rules, links that exist)
//! rather than just verifying call sequences. This lets tests assert on
//! the system's _state_ after a lifecycle operation, not just which
//! calls happened. `calls` records operation names for the tests that
//! do care about call counts (idempotency).
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability in async contexts.

#![cfg(test)]

use async_trait::async_trait;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::iprule::PolicyAgent;
use crate::netlink_ops::{rule_matches, LinkInfo, NetlinkOps, RouteSpec, RuleSpec};
use crate::route::{Family, Route, RouteAgent};
use crate::rpfilter::RpFilterManager;
use crate::Error;

// ============================================================================
// MockNetlinkOps
// ============================================================================

#[derive(Debug, Default)]
pub struct NetlinkState {
    pub routes: Vec<RouteSpec>,
    pub rules: Vec<RuleSpec>,
    pub links: Vec<LinkInfo>,
    /// Map of operation name -> error message. If set, the operation will fail.
    pub fail_on: HashMap<String, String>,
    /// Operation names in call order.
    pub calls: Vec<String>,
}

impl NetlinkState {
    fn enter(&mut self, op: &str) -> Result<(), Error> {
        self.calls.push(op.to_string());
        if let Some(msg) = self.fail_on.get(op) {
            Err(Error::General(msg.clone()))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct MockNetlinkOps {
    pub state: Arc<Mutex<NetlinkState>>,
}

impl MockNetlinkOps {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetlinkState::default())),
        }
    }

    pub fn with_state(state: NetlinkState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| *c == op).count()
    }
}

fn same_destination(a: &RouteSpec, b: &RouteSpec) -> bool {
    a.family == b.family && a.destination == b.destination && a.table == b.table
}

#[async_trait]
impl NetlinkOps for MockNetlinkOps {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.enter("route_add")?;

        if let Some(existing) = s.routes.iter().find(|r| same_destination(r, route)) {
            // The kernel answers EEXIST for any same-destination route in
            // the table, whatever its nexthop.
            if existing.gateway == route.gateway && existing.if_index == route.if_index {
                return Err(Error::General(format!("route already exists: {route:?}")));
            }
            return Err(Error::RouteToOtherDestinationExists);
        }
        s.routes.push(route.clone());
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.enter("route_del")?;

        let before = s.routes.len();
        s.routes.retain(|r| !same_destination(r, route));
        if s.routes.len() == before {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn route_list(&self, family: Family, table: Option<u32>) -> Result<Vec<RouteSpec>, Error> {
        let mut s = self.state.lock().unwrap();
        s.enter("route_list")?;

        Ok(s.routes
            .iter()
            .filter(|r| r.family == family && table.is_none_or(|id| r.table == id))
            .cloned()
            .collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.enter("rule_add")?;
        s.rules.push(rule.clone());
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.enter("rule_del")?;

        let Some(pos) = s.rules.iter().position(|r| rule_matches(r, rule)) else {
            return Err(Error::NotFound);
        };
        s.rules.remove(pos);
        Ok(())
    }

    async fn rule_list(&self, family: Family) -> Result<Vec<RuleSpec>, Error> {
        let mut s = self.state.lock().unwrap();
        s.enter("rule_list")?;

        let mut rules: Vec<_> = s.rules.iter().filter(|r| r.family == family).cloned().collect();
        rules.sort_by_key(|r| r.priority.unwrap_or(0));
        Ok(rules)
    }

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        let mut s = self.state.lock().unwrap();
        s.enter("link_list")?;
        Ok(s.links.clone())
    }
}

// ============================================================================
// MockRpFilter
// ============================================================================

#[derive(Debug, Default)]
pub struct RpFilterState {
    pub set_calls: u32,
    pub unset_calls: u32,
    pub fail_on: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct MockRpFilter {
    pub state: Arc<Mutex<RpFilterState>>,
}

#[async_trait]
impl RpFilterManager for MockRpFilter {
    async fn set(&self) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.set_calls += 1;
        if let Some(msg) = s.fail_on.get("set") {
            return Err(Error::General(msg.clone()));
        }
        Ok(())
    }

    async fn unset(&self) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.unset_calls += 1;
        if let Some(msg) = s.fail_on.get("unset") {
            return Err(Error::General(msg.clone()));
        }
        Ok(())
    }
}

// ============================================================================
// MockRouteAgent
// ============================================================================

#[derive(Debug, Default)]
pub struct RouteAgentState {
    pub routes: Vec<Route>,
    pub add_calls: u32,
    pub flush_calls: u32,
    pub fail_on: HashMap<String, String>,
}

/// Route agent that only records; the duplicate/pre-existence contract
/// lives in the real backends and is not repeated here.
#[derive(Clone, Default)]
pub struct MockRouteAgent {
    pub state: Arc<Mutex<RouteAgentState>>,
}

#[async_trait]
impl RouteAgent for MockRouteAgent {
    async fn add(&mut self, route: &Route) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.add_calls += 1;
        if let Some(msg) = s.fail_on.get("add") {
            return Err(Error::General(msg.clone()));
        }
        s.routes.push(route.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.flush_calls += 1;
        if let Some(msg) = s.fail_on.get("flush") {
            return Err(Error::General(msg.clone()));
        }
        s.routes.clear();
        Ok(())
    }
}

// ============================================================================
// MockPolicyAgent
// ============================================================================

#[derive(Debug, Default)]
pub struct PolicyAgentState {
    pub setups: Vec<(bool, bool, bool)>,
    pub cleanups: u32,
    pub table: u32,
    pub fail_on: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct MockPolicyAgent {
    pub state: Arc<Mutex<PolicyAgentState>>,
}

#[async_trait]
impl PolicyAgent for MockPolicyAgent {
    async fn setup_routing_rules(
        &self,
        ipv6_enabled: bool,
        enable_local: bool,
        lan_discovery: bool,
    ) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        if let Some(msg) = s.fail_on.get("setup") {
            return Err(Error::General(msg.clone()));
        }
        s.setups.push((ipv6_enabled, enable_local, lan_discovery));
        Ok(())
    }

    async fn cleanup_routing(&self) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        if let Some(msg) = s.fail_on.get("cleanup") {
            return Err(Error::General(msg.clone()));
        }
        s.cleanups += 1;
        Ok(())
    }

    async fn table_id(&self) -> u32 {
        self.state.lock().unwrap().table
    }

    async fn table_id_for(&self, family: Family) -> Option<u32> {
        let s = self.state.lock().unwrap();
        match family {
            Family::V4 if s.table != 0 => Some(s.table),
            _ => None,
        }
    }
}
