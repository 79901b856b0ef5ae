//! Enable/disable wrapper around a route agent.
//!
//! While disabled, calls land in a noop agent so callers never have to
//! care whether routing is currently active. The routes applied while
//! disabled are remembered and replayed into the working agent on
//! [`Router::enable`].

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::route::{Route, RouteAgent};
use crate::Error;

/// Which agent currently receives calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Backend {
    Noop,
    Working,
}

/// Agent that accepts everything and touches nothing.
#[derive(Debug, Default)]
pub struct NoopRouteAgent;

#[async_trait]
impl RouteAgent for NoopRouteAgent {
    async fn add(&mut self, _route: &Route) -> Result<(), Error> {
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

struct State<A> {
    noop: NoopRouteAgent,
    working: A,
    active: Backend,
    applied: Vec<Route>,
}

impl<A: RouteAgent> State<A> {
    fn current(&mut self) -> &mut dyn RouteAgent {
        match self.active {
            Backend::Noop => &mut self.noop,
            Backend::Working => &mut self.working,
        }
    }
}

/// Stateful router over one working [`RouteAgent`].
///
/// All state sits behind one lock; the kernel itself cannot be locked,
/// so concurrent daemons are handled through the agents' conflict
/// errors rather than assumed away.
pub struct Router<A: RouteAgent> {
    state: Mutex<State<A>>,
}

impl<A: RouteAgent> Router<A> {
    pub fn new(working: A, enabled: bool) -> Self {
        Self {
            state: Mutex::new(State {
                noop: NoopRouteAgent,
                working,
                active: if enabled { Backend::Working } else { Backend::Noop },
                applied: Vec::new(),
            }),
        }
    }

    /// Adds a route through the active agent and remembers it for
    /// replay across disable/enable cycles.
    pub async fn add(&self, route: Route) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.current().add(&route).await?;
        state.applied.push(route);
        Ok(())
    }

    /// Flushes the active agent and forgets all remembered routes.
    pub async fn flush(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.current().flush().await?;
        state.applied.clear();
        Ok(())
    }

    /// Switches to the working agent, replaying every remembered route.
    /// Routes destined for a custom table are rewritten to `table_id`,
    /// routes for the main table (id 0) are kept as-is. No-op when
    /// already enabled.
    pub async fn enable(&self, table_id: u32) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if state.active == Backend::Working {
            return Ok(());
        }

        let replay: Vec<Route> = state
            .applied
            .iter()
            .map(|route| {
                let mut route = route.clone();
                if route.table_id != 0 {
                    route.table_id = table_id;
                }
                route
            })
            .collect();
        for route in &replay {
            state.working.add(route).await?;
        }

        state.active = Backend::Working;
        tracing::debug!(table_id, routes = replay.len(), "routing enabled");
        Ok(())
    }

    /// Flushes live routes and switches to the noop agent. Remembered
    /// routes are kept so a later [`Router::enable`] restores them.
    /// No-op when already disabled.
    pub async fn disable(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if state.active == Backend::Noop {
            return Ok(());
        }

        state.working.flush().await?;
        state.active = Backend::Noop;
        tracing::debug!("routing disabled");
        Ok(())
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.active == Backend::Working
    }
}
