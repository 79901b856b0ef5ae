//! Enable/disable wrapper around a policy agent.
//!
//! Same pattern as [`crate::router::Router`], but over whole
//! configuration snapshots instead of individual routes: the last
//! applied `{ipv6_enabled, enable_local, lan_discovery}` tuple survives
//! a disable and is replayed on enable.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::iprule::PolicyAgent;
use crate::route::Family;
use crate::router::Backend;
use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct AppliedConfig {
    ipv6_enabled: bool,
    enable_local: bool,
    lan_discovery: bool,
}

/// Agent that accepts everything and touches nothing. Its table id is
/// always 0 (the main table), matching "no custom table set up".
pub struct NoopPolicyAgent;

#[async_trait]
impl PolicyAgent for NoopPolicyAgent {
    async fn setup_routing_rules(
        &self,
        _ipv6_enabled: bool,
        _enable_local: bool,
        _lan_discovery: bool,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn cleanup_routing(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn table_id(&self) -> u32 {
        0
    }

    async fn table_id_for(&self, _family: Family) -> Option<u32> {
        None
    }
}

struct State<P> {
    noop: NoopPolicyAgent,
    working: P,
    active: Backend,
    applied: Option<AppliedConfig>,
}

impl<P: PolicyAgent> State<P> {
    fn current(&self) -> &dyn PolicyAgent {
        match self.active {
            Backend::Noop => &self.noop,
            Backend::Working => &self.working,
        }
    }
}

/// Stateful policy router over one working [`PolicyAgent`].
pub struct PolicyRouter<P: PolicyAgent> {
    state: Mutex<State<P>>,
}

impl<P: PolicyAgent> PolicyRouter<P> {
    pub fn new(working: P, enabled: bool) -> Self {
        Self {
            state: Mutex::new(State {
                noop: NoopPolicyAgent,
                working,
                active: if enabled { Backend::Working } else { Backend::Noop },
                applied: None,
            }),
        }
    }

    /// Applies the configuration through the active agent and remembers
    /// it for replay across disable/enable cycles.
    pub async fn setup_routing_rules(
        &self,
        ipv6_enabled: bool,
        enable_local: bool,
        lan_discovery: bool,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state
            .current()
            .setup_routing_rules(ipv6_enabled, enable_local, lan_discovery)
            .await?;
        state.applied = Some(AppliedConfig {
            ipv6_enabled,
            enable_local,
            lan_discovery,
        });
        Ok(())
    }

    /// Tears down through the active agent and forgets the snapshot.
    pub async fn cleanup_routing(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.current().cleanup_routing().await?;
        state.applied = None;
        Ok(())
    }

    pub async fn table_id(&self) -> u32 {
        self.state.lock().await.current().table_id().await
    }

    pub async fn table_id_for(&self, family: Family) -> Option<u32> {
        self.state.lock().await.current().table_id_for(family).await
    }

    /// Switches to the working agent, replaying the remembered
    /// configuration if there is one. No-op when already enabled.
    pub async fn enable(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if state.active == Backend::Working {
            return Ok(());
        }

        if let Some(config) = state.applied {
            state
                .working
                .setup_routing_rules(config.ipv6_enabled, config.enable_local, config.lan_discovery)
                .await?;
        }
        state.active = Backend::Working;
        tracing::debug!("policy routing enabled");
        Ok(())
    }

    /// Cleans up live rules and switches to the noop agent, keeping the
    /// snapshot for a later [`PolicyRouter::enable`]. No-op when
    /// already disabled.
    pub async fn disable(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if state.active == Backend::Noop {
            return Ok(());
        }

        state.working.cleanup_routing().await?;
        state.active = Backend::Noop;
        tracing::debug!("policy routing disabled");
        Ok(())
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.active == Backend::Working
    }
}
