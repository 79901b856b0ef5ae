//! Reverse-path filter management.
//!
//! Strict rp_filter drops the return traffic of policy-routed
//! connections, so the kernel is switched to loose mode (2) while the
//! fwmark rules are installed and restored afterwards.

use async_trait::async_trait;
use tokio::sync::Mutex;

use std::path::PathBuf;

use crate::Error;

const RP_FILTER_PATH: &str = "/proc/sys/net/ipv4/conf/all/rp_filter";
const LOOSE_MODE: &str = "2";

#[async_trait]
pub trait RpFilterManager: Send + Sync {
    async fn set(&self) -> Result<(), Error>;
    async fn unset(&self) -> Result<(), Error>;
}

/// [`RpFilterManager`] writing the sysctl through procfs.
pub struct SysctlRpFilter {
    path: PathBuf,
    previous: Mutex<Option<String>>,
}

impl SysctlRpFilter {
    pub fn new() -> Self {
        Self::with_path(RP_FILTER_PATH.into())
    }

    /// Path override for tests.
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            previous: Mutex::new(None),
        }
    }
}

impl Default for SysctlRpFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpFilterManager for SysctlRpFilter {
    async fn set(&self) -> Result<(), Error> {
        let mut previous = self.previous.lock().await;
        if previous.is_some() {
            return Ok(());
        }

        let current = tokio::fs::read_to_string(&self.path).await?.trim().to_string();
        if current != LOOSE_MODE {
            tracing::debug!(from = %current, "switching rp_filter to loose mode");
            tokio::fs::write(&self.path, LOOSE_MODE).await?;
        }
        *previous = Some(current);
        Ok(())
    }

    async fn unset(&self) -> Result<(), Error> {
        let mut previous = self.previous.lock().await;
        let Some(original) = previous.take() else {
            return Ok(());
        };

        if original != LOOSE_MODE {
            tracing::debug!(to = %original, "restoring rp_filter");
            tokio::fs::write(&self.path, original).await?;
        }
        Ok(())
    }
}
