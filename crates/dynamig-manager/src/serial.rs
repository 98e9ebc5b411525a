//! Serialized lifecycle calls for concurrent callers
//!
//! The device partition table is shared state owned by the driver. Two
//! allocations racing on the same placement both end up with the same slice
//! thanks to reconciliation, but not atomically. `SerializedAllocator` runs
//! calls touching the same (device, placement) one at a time.

use crate::allocator::{device_lookup_error, PartitionAllocator};
use crate::reclaimer::PartitionReclaimer;
use dynamig_core::{
    DeviceIdentity, DeviceSelector, MigError, MigResult, Operation, Placement, Profile,
    ProfileCatalog, Slice,
};
use dynamig_driver::DeviceDriver;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

type LockKey = (DeviceIdentity, Placement);

/// Allocator and reclaimer behind a per-(device, placement) lock
pub struct SerializedAllocator<D: DeviceDriver> {
    driver: D,
    locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

impl<D: DeviceDriver> SerializedAllocator<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn lock_for(&self, key: LockKey) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key).or_default().clone()
    }

    /// Run `f` while holding the lock for `key`.
    ///
    /// The map entry is dropped once no caller holds or waits on it, so the
    /// map only contains placements with calls in flight.
    fn with_lock<T>(&self, key: LockKey, f: impl FnOnce() -> T) -> T {
        let lock = self.lock_for(key.clone());
        let result = {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f()
        };

        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference in the map, one held here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&key);
        }
        result
    }

    pub fn allocate(
        &self,
        selector: &DeviceSelector,
        profile_name: &str,
        profile: &Profile,
        placement: Placement,
    ) -> MigResult<Slice> {
        let device = self
            .driver
            .device(selector)
            .map_err(|e| device_lookup_error(selector, e))?;
        let identity = self
            .driver
            .device_identity(&device)
            .map_err(|e| MigError::driver(Operation::DeviceIdentity, selector.to_string(), e))?;

        debug!(device = %identity, start = placement.start, "Waiting for placement lock");
        self.with_lock((identity, placement), || {
            PartitionAllocator::new(&self.driver).allocate(&device, profile_name, profile, placement)
        })
    }

    pub fn allocate_named(
        &self,
        selector: &DeviceSelector,
        catalog: &ProfileCatalog,
        profile_name: &str,
        start: u32,
    ) -> MigResult<Slice> {
        let profile = catalog.lookup(profile_name)?;
        self.allocate(
            selector,
            profile_name,
            profile,
            Placement::for_profile(profile, start),
        )
    }

    /// Reclaim under the lock of the GPU instance's placement.
    ///
    /// When the GPU instance cannot be resolved the reclaim runs unlocked so
    /// the reclaimer reports the lookup failure itself.
    pub fn reclaim(&self, selector: &DeviceSelector, gi: u32, ci: u32) -> MigResult<()> {
        let reclaimer = PartitionReclaimer::new(&self.driver);
        match self.placement_of(selector, gi) {
            Some(key) => self.with_lock(key, || reclaimer.reclaim(selector, gi, ci)),
            None => reclaimer.reclaim(selector, gi, ci),
        }
    }

    fn placement_of(&self, selector: &DeviceSelector, gi: u32) -> Option<LockKey> {
        let device = self.driver.device(selector).ok()?;
        let identity = self.driver.device_identity(&device).ok()?;
        let instance = self.driver.instance_by_id(&device, gi).ok()?;
        let placement = self.driver.instance_placement(&instance).ok()?;
        Some((identity, placement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynamig_core::SliceState;
    use dynamig_driver::SimulatedDriver;
    use std::thread;

    #[test]
    fn test_concurrent_allocations_converge() {
        let allocator = Arc::new(SerializedAllocator::new(SimulatedDriver::new(1, 8)));
        let catalog = Arc::new(ProfileCatalog::a100());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                let catalog = Arc::clone(&catalog);
                thread::spawn(move || {
                    allocator
                        .allocate_named(&DeviceSelector::Index(0), &catalog, "2g.10gb", 2)
                        .unwrap()
                })
            })
            .collect();

        let slices: Vec<Slice> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let first = slices[0].state;
        assert!(matches!(first, SliceState::Ready { .. }));
        assert!(slices.iter().all(|s| s.state == first));
        assert_eq!(slices.iter().filter(|s| !s.recovered).count(), 1);
        assert_eq!(allocator.driver().instance_count(0), 1);
        assert!(allocator.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_distinct_placements_get_distinct_instances() {
        let allocator = SerializedAllocator::new(SimulatedDriver::new(1, 8));
        let catalog = ProfileCatalog::a100();

        let a = allocator
            .allocate_named(&DeviceSelector::Index(0), &catalog, "1g.5gb", 0)
            .unwrap();
        let b = allocator
            .allocate_named(&DeviceSelector::Index(0), &catalog, "1g.5gb", 1)
            .unwrap();

        assert_ne!(a.gi(), b.gi());
        assert!(allocator.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_reclaim_through_lock() {
        let allocator = SerializedAllocator::new(SimulatedDriver::new(1, 8));
        let catalog = ProfileCatalog::a100();
        let slice = allocator
            .allocate_named(&DeviceSelector::Index(0), &catalog, "3g.20gb", 0)
            .unwrap();

        allocator
            .reclaim(
                &DeviceSelector::from(&slice.device),
                slice.gi().unwrap(),
                slice.ci().unwrap(),
            )
            .unwrap();
        assert_eq!(allocator.driver().instance_count(0), 0);

        let err = allocator
            .reclaim(&DeviceSelector::Index(0), 0, 0)
            .unwrap_err();
        assert_eq!(err.kind(), dynamig_core::ErrorKind::InstanceNotFound);
    }
}
