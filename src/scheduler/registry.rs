use std::sync::Arc;

use arc_swap::ArcSwap;

use super::backend_config::BackendConfig;

/// Holds the current `BackendConfig` snapshot. Readers take a reference to
/// the snapshot for the duration of one scheduling call; the membership
/// updater publishes a whole new snapshot at once.
#[derive(Debug)]
pub struct BackendRegistry {
    current: ArcSwap<BackendConfig>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new(BackendConfig::new())
    }
}

impl BackendRegistry {
    pub fn new(initial: BackendConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub fn get(&self) -> Arc<BackendConfig> {
        self.current.load_full()
    }

    pub fn set(&self, config: Arc<BackendConfig>) {
        self.current.store(config);
    }
}
