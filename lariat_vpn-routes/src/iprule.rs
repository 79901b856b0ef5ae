//! Policy rule management.
//!
//! Installs the fwmark rule pair that diverts unmarked traffic into a
//! custom routing table:
//!
//! ```text
//! <prio>: not from all fwmark <mark> lookup <table>
//! <prio>: from all lookup main suppress_prefixlength 0
//! ```
//!
//! The suppress rule is only present while local traffic is allowed; it
//! lets the specific routes of the main table win over the custom
//! table's default route without letting that table's own default route
//! apply. Priorities and table ids are allocated against whatever the
//! host already uses, see [`find_rule_priority_candidate`] and
//! [`IpRuleManager::calculate_custom_table_id`].

use async_trait::async_trait;

use lariat_vpn_lib::config::RoutingConfig;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::netlink_ops::{NetlinkOps, RuleSpec};
use crate::route::Family;
use crate::rpfilter::RpFilterManager;
use crate::{Error, CUSTOM_TABLE_ID_BASE, CUSTOM_TABLE_ID_MAX, MAIN_TABLE_ID};

/// Manages the policy rules and rp_filter state needed while connected.
#[async_trait]
pub trait PolicyAgent: Send + Sync {
    async fn setup_routing_rules(
        &self,
        ipv6_enabled: bool,
        enable_local: bool,
        lan_discovery: bool,
    ) -> Result<(), Error>;
    async fn cleanup_routing(&self) -> Result<(), Error>;
    /// Custom table id resolved for IPv4, 0 before setup.
    async fn table_id(&self) -> u32;
    /// Custom table id resolved for the given family, if set up.
    async fn table_id_for(&self, family: Family) -> Option<u32>;
}

/// Whether this is the kernel's implicit "from all lookup main" rule.
/// Any selector disqualifies it: source, fwmark, inversion, suppression.
pub fn is_from_all_lookup_main(rule: &RuleSpec) -> bool {
    rule.table == MAIN_TABLE_ID
        && !rule.invert
        && rule.fw_mark.is_none()
        && rule.src.is_none()
        && rule.suppress_prefix_len.is_none()
}

/// Finds a free rule priority strictly below the "from all lookup main"
/// rule, walking downwards past occupied priorities. Priority 0 is
/// never returned; running out of room is an error.
pub fn find_rule_priority_candidate(rules: &[RuleSpec]) -> Result<u32, Error> {
    let main_priority = rules
        .iter()
        .find(|r| is_from_all_lookup_main(r))
        .and_then(|r| r.priority)
        .ok_or(Error::NoFreeRulePriority)?;
    let used: HashSet<u32> = rules.iter().filter_map(|r| r.priority).collect();

    let mut candidate = main_priority;
    loop {
        candidate = candidate.checked_sub(1).ok_or(Error::NoFreeRulePriority)?;
        if candidate == 0 {
            return Err(Error::NoFreeRulePriority);
        }
        if !used.contains(&candidate) {
            return Ok(candidate);
        }
    }
}

/// Table id of an already installed fwmark rule, if any. The table is
/// deliberately not part of the match so the id survives a daemon
/// restart.
fn find_fwmark_table(rules: &[RuleSpec], fwmark: u32) -> Option<u32> {
    rules
        .iter()
        .find(|r| r.invert && r.fw_mark == Some(fwmark) && r.suppress_prefix_len.is_none())
        .map(|r| r.table)
}

fn fwmark_rule(family: Family, fwmark: u32, table: u32, priority: Option<u32>) -> RuleSpec {
    let mut rule = RuleSpec::to_table(family, table);
    rule.invert = true;
    rule.fw_mark = Some(fwmark);
    rule.priority = priority;
    rule
}

fn suppress_rule(family: Family, priority: Option<u32>) -> RuleSpec {
    let mut rule = RuleSpec::to_table(family, MAIN_TABLE_ID);
    rule.suppress_prefix_len = Some(0);
    rule.priority = priority;
    rule
}

fn is_suppress_rule(rule: &RuleSpec) -> bool {
    !rule.invert
        && rule.fw_mark.is_none()
        && rule.src.is_none()
        && rule.table == MAIN_TABLE_ID
        && rule.suppress_prefix_len == Some(0)
}

/// [`PolicyAgent`] over [`NetlinkOps`] and an [`RpFilterManager`].
pub struct IpRuleManager<O: NetlinkOps, R: RpFilterManager> {
    ops: O,
    rpfilter: R,
    fwmark: u32,
    table_ids: Mutex<HashMap<Family, u32>>,
}

impl<O: NetlinkOps, R: RpFilterManager> IpRuleManager<O, R> {
    pub fn new(ops: O, rpfilter: R, fwmark: u32) -> Result<Self, Error> {
        if fwmark == 0 {
            return Err(Error::ZeroFwmark);
        }
        Ok(Self {
            ops,
            rpfilter,
            fwmark,
            table_ids: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(ops: O, rpfilter: R, config: &RoutingConfig) -> Result<Self, Error> {
        Self::new(ops, rpfilter, config.fwmark)
    }

    /// Smallest unused table id in `[CUSTOM_TABLE_ID_BASE, CUSTOM_TABLE_ID_MAX]`,
    /// judged against every table the family's routes currently live in.
    async fn calculate_custom_table_id(&self, family: Family) -> Result<u32, Error> {
        let routes = self.ops.route_list(family, None).await?;
        let used: HashSet<u32> = routes.iter().map(|r| r.table).collect();

        let mut id = CUSTOM_TABLE_ID_BASE;
        while used.contains(&id) {
            id += 1;
            if id > CUSTOM_TABLE_ID_MAX {
                return Err(Error::NoFreeTableId);
            }
        }
        Ok(id)
    }

    async fn setup_family(&self, family: Family, allow_local: bool) -> Result<(), Error> {
        let rules = self.ops.rule_list(family).await?;
        let table = match find_fwmark_table(&rules, self.fwmark) {
            Some(table) => {
                tracing::debug!(%family, table, "reusing existing fwmark rule");
                table
            }
            None => {
                let priority = find_rule_priority_candidate(&rules)?;
                let table = self.calculate_custom_table_id(family).await?;
                self.ops
                    .rule_add(&fwmark_rule(family, self.fwmark, table, Some(priority)))
                    .await?;
                tracing::debug!(%family, priority, table, fwmark = self.fwmark, "installed fwmark rule");
                table
            }
        };
        self.table_ids.lock().unwrap().insert(family, table);

        if allow_local {
            self.enable_local_traffic(family).await?;
        } else {
            match self.remove_suppress_prefix_rule(family).await {
                Ok(()) | Err(Error::NotFound) => {}
                Err(err) => {
                    tracing::warn!(%err, %family, "failed to remove suppress_prefixlength rule, continuing anyway");
                }
            }
        }
        Ok(())
    }

    /// Ensures the `suppress_prefixlength 0` rule on the main table so
    /// routes to local networks keep working while connected.
    async fn enable_local_traffic(&self, family: Family) -> Result<(), Error> {
        let rules = self.ops.rule_list(family).await?;
        if rules.iter().any(is_suppress_rule) {
            return Ok(());
        }
        let priority = find_rule_priority_candidate(&rules)?;
        self.ops.rule_add(&suppress_rule(family, Some(priority))).await?;
        tracing::debug!(%family, priority, "installed suppress_prefixlength rule");
        Ok(())
    }

    async fn remove_suppress_prefix_rule(&self, family: Family) -> Result<(), Error> {
        let rules = self.ops.rule_list(family).await?;
        let matching: Vec<_> = rules.into_iter().filter(is_suppress_rule).collect();
        if matching.is_empty() {
            return Err(Error::NotFound);
        }
        for rule in &matching {
            self.ops.rule_del(rule).await?;
        }
        Ok(())
    }

    async fn remove_fwmark_rule(&self, family: Family) -> Result<(), Error> {
        let rules = self.ops.rule_list(family).await?;
        let matching: Vec<_> = rules
            .into_iter()
            .filter(|r| r.invert && r.fw_mark == Some(self.fwmark) && r.suppress_prefix_len.is_none())
            .collect();
        if matching.is_empty() {
            return Err(Error::NotFound);
        }
        for rule in &matching {
            self.ops.rule_del(rule).await?;
        }
        Ok(())
    }

    /// Compensates a half-done setup: removes both rule kinds for every
    /// family that was attempted. Failures here only get logged, the
    /// original error is what the caller sees.
    async fn rollback_families(&self, families: &[Family]) {
        for family in families {
            match self.remove_suppress_prefix_rule(*family).await {
                Ok(()) | Err(Error::NotFound) => {}
                Err(err) => tracing::warn!(%err, family = %family, "rollback of suppress rule failed"),
            }
            match self.remove_fwmark_rule(*family).await {
                Ok(()) | Err(Error::NotFound) => {}
                Err(err) => tracing::warn!(%err, family = %family, "rollback of fwmark rule failed"),
            }
        }
    }

    async fn setup_families(&self, families: &[Family], allow_local: bool) -> Result<(), Error> {
        for family in families {
            self.setup_family(*family, allow_local).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<O: NetlinkOps, R: RpFilterManager> PolicyAgent for IpRuleManager<O, R> {
    async fn setup_routing_rules(
        &self,
        ipv6_enabled: bool,
        enable_local: bool,
        lan_discovery: bool,
    ) -> Result<(), Error> {
        self.rpfilter.set().await?;

        let mut families = vec![Family::V4];
        if ipv6_enabled {
            families.push(Family::V6);
        }
        let allow_local = enable_local || lan_discovery;

        if let Err(err) = self.setup_families(&families, allow_local).await {
            self.rollback_families(&families).await;
            return Err(err);
        }
        Ok(())
    }

    async fn cleanup_routing(&self) -> Result<(), Error> {
        for family in [Family::V4, Family::V6] {
            match self.remove_suppress_prefix_rule(family).await {
                Ok(()) | Err(Error::NotFound) => {}
                Err(err) => {
                    tracing::warn!(%err, %family, "failed to remove suppress_prefixlength rule, continuing anyway");
                }
            }
            match self.remove_fwmark_rule(family).await {
                Ok(()) | Err(Error::NotFound) => {}
                Err(err) => tracing::warn!(%err, %family, "failed to remove fwmark rule, continuing anyway"),
            }
        }
        self.rpfilter.unset().await
    }

    async fn table_id(&self) -> u32 {
        self.table_ids.lock().unwrap().get(&Family::V4).copied().unwrap_or(0)
    }

    async fn table_id_for(&self, family: Family) -> Option<u32> {
        self.table_ids.lock().unwrap().get(&family).copied()
    }
}
