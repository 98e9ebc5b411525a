//! dynamig-manager: MIG slice lifecycle
//!
//! This crate drives a `DeviceDriver` through the slice lifecycle:
//! - Allocation with reconciliation of slices left by earlier runs
//! - Ordered teardown (compute instance before GPU instance)
//! - Per-placement serialization for concurrent callers
//! - Inventory of existing slices

pub mod allocator;
pub mod inventory;
pub mod reclaimer;
pub mod serial;

pub use allocator::PartitionAllocator;
pub use inventory::{DeviceSlices, Inventory, SliceRecord};
pub use reclaimer::PartitionReclaimer;
pub use serial::SerializedAllocator;
