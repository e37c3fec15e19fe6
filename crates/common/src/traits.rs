use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::bio::Bio;

/// An underlying block device.
///
/// `submit` hands the bio over; the device signals completion by calling
/// [`Bio::complete`]. Completion may happen before `submit` returns or later
/// on a thread owned by the device, so callers must have finished their own
/// bookkeeping for the bio before submitting it.
pub trait BlockDevice: Send + Sync {
    /// Name used in table lines and log fields.
    fn name(&self) -> &str;

    /// Size in sectors.
    fn capacity_sectors(&self) -> u64;

    fn submit(&self, bio: Bio);
}

/// Name → device lookup used when a table line refers to a device by name.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<BTreeMap<String, Arc<dyn BlockDevice>>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under its own name, replacing any previous entry.
    pub fn register(&self, device: Arc<dyn BlockDevice>) {
        let name = device.name().to_string();
        debug!(device = %name, sectors = device.capacity_sectors(), "registered block device");
        self.devices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name, device);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        self.devices
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        self.devices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.devices
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDevice;

    impl BlockDevice for NullDevice {
        fn name(&self) -> &str {
            "null0"
        }

        fn capacity_sectors(&self) -> u64 {
            8
        }

        fn submit(&self, bio: Bio) {
            bio.complete(Ok(()));
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = DeviceRegistry::new();
        assert!(registry.lookup("null0").is_none());

        registry.register(Arc::new(NullDevice));
        let device = registry.lookup("null0").expect("registered");
        assert_eq!(device.capacity_sectors(), 8);
        assert_eq!(registry.names(), vec!["null0".to_string()]);

        assert!(registry.remove("null0").is_some());
        assert!(registry.lookup("null0").is_none());
    }
}
