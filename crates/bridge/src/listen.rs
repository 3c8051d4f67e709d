//! Long-poll device change detection
//!
//! Snapshots are compared in canonical JSON form: object keys sorted, array
//! order preserved. Paths are already sorted by enumeration, so equal device
//! sets always produce equal text.

use common::Result;
use protocol::DeviceDescriptor;
use serde_json::Value as Json;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Canonical text of a snapshot
pub fn canonical(devices: &[DeviceDescriptor]) -> String {
    // serde_json maps are key-ordered, so re-serializing sorts object keys
    serde_json::to_value(devices)
        .map(|value| value.to_string())
        .unwrap_or_default()
}

/// Canonical text of a caller-provided snapshot
///
/// Snapshots that parse as device lists are normalized through the typed
/// form, so numeric and textual session ids compare equal.
pub fn canonical_previous(previous: &Json) -> String {
    match serde_json::from_value::<Vec<DeviceDescriptor>>(previous.clone()) {
        Ok(devices) => canonical(&devices),
        Err(_) => previous.to_string(),
    }
}

/// Bounded polling loop plus the last snapshot any listen returned
pub struct Listener {
    iterations: u32,
    delay: Duration,
    last: Mutex<Option<String>>,
}

impl Listener {
    pub fn new(iterations: u32, delay: Duration) -> Self {
        Self {
            iterations: iterations.max(1),
            delay,
            last: Mutex::new(None),
        }
    }

    /// Enumerate until the snapshot differs from the baseline or the
    /// iteration budget runs out
    ///
    /// The baseline is `previous`, or else the last snapshot returned by any
    /// earlier listen.
    pub async fn listen<F, Fut>(
        &self,
        previous: Option<&Json>,
        mut enumerate: F,
    ) -> Result<Vec<DeviceDescriptor>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<DeviceDescriptor>>>,
    {
        let baseline = match previous {
            Some(previous) => Some(canonical_previous(previous)),
            None => self.last.lock().await.clone(),
        };

        let mut iteration = 0;
        loop {
            iteration += 1;
            let devices = enumerate().await?;
            let current = canonical(&devices);

            let changed = baseline.as_deref() != Some(current.as_str());
            if changed || iteration >= self.iterations {
                debug!(
                    "Listen returning after {} iterations (changed: {})",
                    iteration, changed
                );
                *self.last.lock().await = Some(current);
                return Ok(devices);
            }

            tokio::time::sleep(self.delay).await;
        }
    }
}
