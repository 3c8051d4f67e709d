//! Driver-health advisory
//!
//! On Linux a device that enumerates but cannot be opened usually means the
//! udev rules are missing. The advisory is informational only and never
//! blocks an operation.

use crate::Bridge;
use crate::storage::PersistedState;
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UdevStatus {
    Display,
    Hide,
}

pub fn advise(state: &PersistedState, on_linux: bool) -> UdevStatus {
    if on_linux && (state.after_install || state.driver_problem_suspected) {
        UdevStatus::Display
    } else {
        UdevStatus::Hide
    }
}

impl Bridge {
    pub async fn udev_status(&self) -> UdevStatus {
        advise(&self.state.get().await, cfg!(target_os = "linux"))
    }

    pub(crate) async fn record_device_failure(&self) {
        debug!("Device access failure recorded");
        if let Err(e) = self
            .state
            .update(|state| state.driver_problem_suspected = true)
            .await
        {
            warn!("Failed to persist driver problem flag: {}", e);
        }
    }

    pub(crate) async fn record_device_success(&self) {
        if let Err(e) = self
            .state
            .update(|state| {
                state.driver_problem_suspected = false;
                state.after_install = false;
            })
            .await
        {
            warn!("Failed to persist driver health: {}", e);
        }
    }
}
