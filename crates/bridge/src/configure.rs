//! Active wire protocol configuration
//!
//! A descriptor is only ever replaced whole: a blob that fails verification,
//! has expired, or does not decode leaves the previous descriptor in place.
//! Calls in flight keep the `Arc` they started with.

use crate::storage::SharedState;
use common::{Error, Result};
use protocol::{ProtocolDescriptor, TrustedKeys, parse_configuration, verify_blob};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub struct Configurator {
    keys: TrustedKeys,
    active: RwLock<Option<Arc<ProtocolDescriptor>>>,
    state: Arc<SharedState>,
}

impl Configurator {
    pub fn new(keys: TrustedKeys, state: Arc<SharedState>) -> Self {
        if keys.is_empty() {
            warn!("No trusted keys configured, every configuration will be rejected");
        }
        Self {
            keys,
            active: RwLock::new(None),
            state,
        }
    }

    /// Verify and decode a blob without activating it
    pub fn parse(&self, blob: &str) -> Result<ProtocolDescriptor> {
        let raw = verify_blob(blob, &self.keys)?;
        Ok(parse_configuration(&raw)?)
    }

    /// Activate a new configuration and remember it for restarts
    pub async fn configure(&self, blob: &str) -> Result<()> {
        let descriptor = self.parse(blob)?;
        let message_types = descriptor.len();
        *self.active.write().await = Some(Arc::new(descriptor));
        info!("Configured wire protocol with {} message types", message_types);

        let blob = blob.trim().to_string();
        if let Err(e) = self
            .state
            .update(|state| state.saved_configuration = Some(blob))
            .await
        {
            warn!("Failed to persist configuration: {}", e);
        }
        Ok(())
    }

    /// Active descriptor, re-applying the persisted blob if none is active
    pub async fn descriptor(&self) -> Result<Arc<ProtocolDescriptor>> {
        if let Some(descriptor) = self.active.read().await.as_ref() {
            return Ok(descriptor.clone());
        }

        let Some(blob) = self.state.get().await.saved_configuration else {
            return Err(Error::NotConfigured);
        };

        match self.parse(&blob) {
            Ok(descriptor) => Ok(self.install_restored(descriptor).await),
            Err(e) => {
                warn!("Persisted configuration rejected: {}", e);
                Err(Error::NotConfigured)
            }
        }
    }

    /// Activate a restored descriptor unless a `configure` got there first
    async fn install_restored(&self, descriptor: ProtocolDescriptor) -> Arc<ProtocolDescriptor> {
        let mut active = self.active.write().await;
        if let Some(current) = active.as_ref() {
            return current.clone();
        }
        let descriptor = Arc::new(descriptor);
        *active = Some(descriptor.clone());
        info!("Restored persisted configuration");
        descriptor
    }

    pub async fn is_configured(&self) -> bool {
        self.descriptor().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStateStore, PersistedState};
    use protocol::test_utils::{signed_configuration, signing_key, trusted_keys_for};

    fn configurator(seed: u8, state: PersistedState) -> (Configurator, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new(state));
        let shared = Arc::new(SharedState::load(store.clone()));
        let keys = trusted_keys_for(&[&signing_key(seed)]);
        (Configurator::new(keys, shared), store)
    }

    #[tokio::test]
    async fn test_unconfigured() {
        let (configurator, _) = configurator(1, PersistedState::default());
        assert!(matches!(
            configurator.descriptor().await,
            Err(Error::NotConfigured)
        ));
        assert!(!configurator.is_configured().await);
    }

    #[tokio::test]
    async fn test_configure_persists_blob() {
        let (configurator, store) = configurator(1, PersistedState::default());
        let blob = signed_configuration(&signing_key(1), None);

        configurator.configure(&blob).await.unwrap();
        assert!(configurator.is_configured().await);
        assert_eq!(store.snapshot().saved_configuration, Some(blob));
    }

    #[tokio::test]
    async fn test_failed_configure_keeps_previous() {
        let (configurator, store) = configurator(1, PersistedState::default());
        let good = signed_configuration(&signing_key(1), None);
        configurator.configure(&good).await.unwrap();
        let before = configurator.descriptor().await.unwrap();

        let expired = signed_configuration(&signing_key(1), Some(1000));
        assert!(matches!(
            configurator.configure(&expired).await,
            Err(Error::ConfigExpired { .. })
        ));
        let untrusted = signed_configuration(&signing_key(2), None);
        assert!(matches!(
            configurator.configure(&untrusted).await,
            Err(Error::BadSignature)
        ));

        let after = configurator.descriptor().await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(store.snapshot().saved_configuration, Some(good));
    }

    #[tokio::test]
    async fn test_persisted_blob_restored() {
        let blob = signed_configuration(&signing_key(1), None);
        let (configurator, _) = configurator(
            1,
            PersistedState {
                saved_configuration: Some(blob),
                ..Default::default()
            },
        );
        let descriptor = configurator.descriptor().await.unwrap();
        assert_eq!(descriptor.type_id("Ping"), Some(1));
    }

    #[tokio::test]
    async fn test_restore_does_not_override_newer_configure() {
        let stored = signed_configuration(&signing_key(1), None);
        let (configurator, store) = configurator(
            1,
            PersistedState {
                saved_configuration: Some(stored.clone()),
                ..Default::default()
            },
        );

        // A restore has read and parsed the stored blob when configure lands
        let restored = configurator.parse(&stored).unwrap();
        let newer = signed_configuration(&signing_key(1), Some(u32::MAX));
        configurator.configure(&newer).await.unwrap();
        let active = configurator.descriptor().await.unwrap();

        let installed = configurator.install_restored(restored).await;
        assert!(Arc::ptr_eq(&installed, &active));
        assert!(Arc::ptr_eq(&configurator.descriptor().await.unwrap(), &active));
        assert_eq!(store.snapshot().saved_configuration, Some(newer));
    }

    #[tokio::test]
    async fn test_expired_persisted_blob_is_not_configured() {
        let blob = signed_configuration(&signing_key(1), Some(1000));
        let (configurator, _) = configurator(
            1,
            PersistedState {
                saved_configuration: Some(blob),
                ..Default::default()
            },
        );
        assert!(matches!(
            configurator.descriptor().await,
            Err(Error::NotConfigured)
        ));
    }
}
