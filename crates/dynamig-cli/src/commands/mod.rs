//! CLI commands implementation

use anyhow::Result;
use dynamig_core::{DeviceSelector, ProfileCatalog, Slice};
use dynamig_driver::DeviceDriver;
use dynamig_manager::{DeviceSlices, Inventory, PartitionAllocator, PartitionReclaimer};

/// Create a slice
pub fn create<D: DeviceDriver>(
    driver: &D,
    catalog: &ProfileCatalog,
    gpu: &DeviceSelector,
    profile: &str,
    start: u32,
) -> Result<()> {
    let slice = PartitionAllocator::new(driver).allocate_named(gpu, catalog, profile, start)?;
    print_slice(&slice);

    if !slice.is_ready() {
        eprintln!(
            "Warning: no compute instance could be resolved in GPU instance {}",
            slice.gi().unwrap_or_default()
        );
    }

    Ok(())
}

/// Delete a slice, or a GPU instance left without compute instance
pub fn delete<D: DeviceDriver>(
    driver: &D,
    gpu: &DeviceSelector,
    gi: u32,
    ci: Option<u32>,
) -> Result<()> {
    let reclaimer = PartitionReclaimer::new(driver);
    match ci {
        Some(ci) => {
            reclaimer.reclaim(gpu, gi, ci)?;
            println!("Deleted compute instance {} and GPU instance {} on {}", ci, gi, gpu);
        }
        None => {
            reclaimer.reclaim_instance(gpu, gi)?;
            println!("Deleted GPU instance {} on {}", gi, gpu);
        }
    }
    Ok(())
}

/// List slices on every GPU
pub fn list<D: DeviceDriver>(driver: &D, catalog: &ProfileCatalog, json: bool) -> Result<()> {
    let devices = Inventory::new(driver, catalog).collect()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    println!("Found {} GPU devices", devices.len());
    for device in &devices {
        if device.mig_enabled {
            println!("GPU {} ({}): MIG mode enabled", device.index, device.name);
        } else {
            println!("GPU {} ({}): MIG mode not enabled", device.index, device.name);
        }
    }

    let total: usize = devices.iter().map(|d| d.slices.len()).sum();
    if total == 0 {
        println!("No MIG slices found on this system.");
        return Ok(());
    }

    let idle: usize = devices.iter().map(DeviceSlices::idle_count).sum();
    println!(
        "\nFound {} MIG slices: {} with compute instances, {} without\n",
        total,
        total - idle,
        idle
    );

    println!(
        "{:<8} {:<8} {:<12} {:<10} {:<10} {:<15}",
        "GPU ID", "GI ID", "PROFILE", "START", "SIZE", "COMPUTE"
    );
    println!("{}", "-".repeat(68));
    for device in &devices {
        for slice in &device.slices {
            let computes = if slice.compute_instances.is_empty() {
                "-".to_string()
            } else {
                slice
                    .compute_instances
                    .iter()
                    .map(|ci| ci.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            };
            println!(
                "{:<8} {:<8} {:<12} {:<10} {:<10} {:<15}",
                device.index,
                slice.gi,
                slice.profile_name,
                slice.placement.start,
                slice.placement.size,
                computes
            );
        }
    }

    Ok(())
}

/// Show the active profile catalog
pub fn profiles(catalog: &ProfileCatalog) {
    println!("Catalog: {}", catalog.name());
    if catalog.is_empty() {
        println!("No profiles defined.");
        return;
    }
    println!(
        "{:<14} {:<12} {:<12} {:<6}",
        "PROFILE", "GI PROFILE", "CI PROFILE", "SLOTS"
    );
    println!("{}", "-".repeat(46));
    for (name, profile) in catalog.iter() {
        println!(
            "{:<14} {:<12} {:<12} {:<6}",
            name, profile.gi_template, profile.ci_template, profile.slot_width
        );
    }
}

/// Helper to print slice details
fn print_slice(slice: &Slice) {
    println!("Slice '{}' on {}", slice.profile_name, slice.device);
    println!("  Placement: {}", slice.placement);
    println!("  State: {}", slice.state);
    if let Some(gi) = slice.gi() {
        println!("  GPU instance: {}", gi);
    }
    if let Some(ci) = slice.ci() {
        println!("  Compute instance: {}", ci);
    }
    println!(
        "  Reused existing GPU instance: {}",
        if slice.recovered { "yes" } else { "no" }
    );
}
