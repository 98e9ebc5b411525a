//! Read-only inventory of the slices present on every device

use crate::allocator::device_lookup_error;
use dynamig_core::{
    DeviceIdentity, DeviceSelector, MigError, MigResult, Operation, Placement, ProfileCatalog,
};
use dynamig_driver::{DeviceDriver, SHARED_ENGINE_SLOT};
use serde::Serialize;
use tracing::{debug, warn};

/// One GPU instance found on a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SliceRecord {
    /// Catalog profile matching the instance's template
    pub profile_name: String,
    pub gi_template: u32,
    pub gi: u32,
    pub placement: Placement,
    /// Compute instances of the profile's compute template
    pub compute_instances: Vec<u32>,
}

/// A device and its slices
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSlices {
    pub index: u32,
    pub identity: DeviceIdentity,
    pub name: String,
    pub mig_enabled: bool,
    pub slices: Vec<SliceRecord>,
}

impl DeviceSlices {
    /// Slices without any compute instance
    pub fn idle_count(&self) -> usize {
        self.slices
            .iter()
            .filter(|s| s.compute_instances.is_empty())
            .count()
    }
}

/// Walks devices and catalog templates to describe current partitions
pub struct Inventory<'a, D: DeviceDriver> {
    driver: &'a D,
    catalog: &'a ProfileCatalog,
}

impl<'a, D: DeviceDriver> Inventory<'a, D> {
    pub fn new(driver: &'a D, catalog: &'a ProfileCatalog) -> Self {
        Self { driver, catalog }
    }

    /// Describe every device. Devices that cannot be queried are skipped
    /// with a warning.
    pub fn collect(&self) -> MigResult<Vec<DeviceSlices>> {
        let count = self
            .driver
            .device_count()
            .map_err(|e| MigError::driver(Operation::DeviceLookup, "device count", e))?;

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            match self.describe(index) {
                Ok(device) => devices.push(device),
                Err(e) => warn!(gpu = index, error = %e, "Skipping device"),
            }
        }
        Ok(devices)
    }

    /// Describe a single device
    pub fn describe(&self, index: u32) -> MigResult<DeviceSlices> {
        let selector = DeviceSelector::Index(index);
        let device = self
            .driver
            .device(&selector)
            .map_err(|e| device_lookup_error(&selector, e))?;
        let identity = self
            .driver
            .device_identity(&device)
            .map_err(|e| MigError::driver(Operation::DeviceIdentity, selector.to_string(), e))?;
        let name = self
            .driver
            .device_name(&device)
            .unwrap_or_else(|_| "Unknown".to_string());
        let mig_enabled = self.driver.mig_enabled(&device).unwrap_or(false);

        let mut slices = Vec::new();
        if mig_enabled {
            for gi_template in self.catalog.gi_templates() {
                slices.extend(self.template_slices(&device, gi_template));
            }
            slices.sort_by_key(|s| (s.placement.start, s.gi));
        }

        Ok(DeviceSlices {
            index,
            identity,
            name,
            mig_enabled,
            slices,
        })
    }

    fn template_slices(&self, device: &D::Device, gi_template: u32) -> Vec<SliceRecord> {
        let Some((profile_name, profile)) = self.catalog.profile_for_template(gi_template) else {
            return Vec::new();
        };

        let instances = match self.driver.list_instances(device, gi_template) {
            Ok(instances) => instances,
            Err(e) => {
                debug!(gi_template = gi_template, error = %e, "Template not listable");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for instance in instances {
            let (Ok(gi), Ok(placement)) = (
                self.driver.instance_id(&instance),
                self.driver.instance_placement(&instance),
            ) else {
                continue;
            };

            let compute_instances: Vec<u32> = self
                .driver
                .sub_template_info(&instance, profile.ci_template, SHARED_ENGINE_SLOT)
                .and_then(|template| self.driver.list_sub_instances(&instance, &template))
                .map(|computes| {
                    computes
                        .iter()
                        .filter_map(|c| self.driver.sub_instance_id(c).ok())
                        .collect()
                })
                .unwrap_or_default();

            records.push(SliceRecord {
                profile_name: profile_name.to_string(),
                gi_template,
                gi,
                placement,
                compute_instances,
            });
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PartitionAllocator;
    use dynamig_driver::SimulatedDriver;

    #[test]
    fn test_inventory_lists_slices_in_placement_order() {
        let driver = SimulatedDriver::new(2, 8);
        let catalog = ProfileCatalog::a100();
        let allocator = PartitionAllocator::new(&driver);
        allocator
            .allocate_named(&DeviceSelector::Index(0), &catalog, "3g.20gb", 4)
            .unwrap();
        allocator
            .allocate_named(&DeviceSelector::Index(0), &catalog, "1g.5gb", 0)
            .unwrap();
        driver.seed_instance(0, 1, Placement::new(2, 2)).unwrap();

        let devices = Inventory::new(&driver, &catalog).collect().unwrap();
        assert_eq!(devices.len(), 2);

        let gpu0 = &devices[0];
        let names: Vec<&str> = gpu0.slices.iter().map(|s| s.profile_name.as_str()).collect();
        assert_eq!(names, vec!["1g.5gb", "2g.10gb", "3g.20gb"]);
        assert_eq!(gpu0.idle_count(), 1);
        assert!(devices[1].slices.is_empty());
    }

    #[test]
    fn test_inventory_skips_slices_when_mig_disabled() {
        let driver = SimulatedDriver::new(1, 8);
        driver.seed_instance(0, 0, Placement::new(0, 1)).unwrap();
        driver.set_mig_enabled(0, false);
        let catalog = ProfileCatalog::a100();

        let device = Inventory::new(&driver, &catalog).describe(0).unwrap();
        assert!(!device.mig_enabled);
        assert!(device.slices.is_empty());
    }

    #[test]
    fn test_inventory_json() {
        let driver = SimulatedDriver::new(1, 8);
        let catalog = ProfileCatalog::a100();
        driver.seed_instance(0, 4, Placement::new(0, 8)).unwrap();

        let devices = Inventory::new(&driver, &catalog).collect().unwrap();
        let json = serde_json::to_value(&devices).unwrap();
        assert_eq!(json[0]["slices"][0]["profile_name"], "7g.40gb");
        assert_eq!(json[0]["slices"][0]["placement"]["size"], 8);
    }
}
