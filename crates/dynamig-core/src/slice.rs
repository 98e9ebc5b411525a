//! Placements, device references and slice lifecycle state

use crate::profile::Profile;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Contiguous span of partitionable slots on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Placement {
    /// First slot of the span
    pub start: u32,
    /// Number of slots
    pub size: u32,
}

impl Placement {
    pub fn new(start: u32, size: u32) -> Self {
        Self { start, size }
    }

    /// Placement at `start` sized to the profile's slot width
    pub fn for_profile(profile: &Profile, start: u32) -> Self {
        Self {
            start,
            size: profile.slot_width,
        }
    }
}

impl std::fmt::Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{start: {}, size: {}}}", self.start, self.size)
    }
}

/// Stable identity of a physical device (the driver's UUID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a caller names a device: by enumeration index or by UUID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceSelector {
    Index(u32),
    Uuid(String),
}

impl FromStr for DeviceSelector {
    type Err = crate::MigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(crate::MigError::DeviceNotFound {
                device: "<empty>".to_string(),
            });
        }
        match s.parse::<u32>() {
            Ok(index) => Ok(DeviceSelector::Index(index)),
            Err(_) => Ok(DeviceSelector::Uuid(s.to_string())),
        }
    }
}

impl From<u32> for DeviceSelector {
    fn from(index: u32) -> Self {
        DeviceSelector::Index(index)
    }
}

impl From<&DeviceIdentity> for DeviceSelector {
    fn from(identity: &DeviceIdentity) -> Self {
        DeviceSelector::Uuid(identity.as_str().to_string())
    }
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelector::Index(index) => write!(f, "GPU {}", index),
            DeviceSelector::Uuid(uuid) => f.write_str(uuid),
        }
    }
}

/// Lifecycle of one slice:
/// `Absent -> GpuInstanceOnly -> Ready -> ComputeDestroyed -> Absent`.
///
/// `GpuInstanceOnly` is both the transient allocation state and the state
/// left by a compute instance that could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SliceState {
    Absent,
    GpuInstanceOnly { gi: u32 },
    Ready { gi: u32, ci: u32 },
    ComputeDestroyed { gi: u32 },
}

impl SliceState {
    pub fn gi(&self) -> Option<u32> {
        match self {
            SliceState::Absent => None,
            SliceState::GpuInstanceOnly { gi }
            | SliceState::Ready { gi, .. }
            | SliceState::ComputeDestroyed { gi } => Some(*gi),
        }
    }

    pub fn ci(&self) -> Option<u32> {
        match self {
            SliceState::Ready { ci, .. } => Some(*ci),
            _ => None,
        }
    }
}

impl std::fmt::Display for SliceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SliceState::Absent => write!(f, "absent"),
            SliceState::GpuInstanceOnly { gi } => write!(f, "gpu-instance-only (gi {})", gi),
            SliceState::Ready { gi, ci } => write!(f, "ready (gi {}, ci {})", gi, ci),
            SliceState::ComputeDestroyed { gi } => write!(f, "compute-destroyed (gi {})", gi),
        }
    }
}

/// One logical partition: a GPU instance, its compute instance and where it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slice {
    /// Parent device
    pub device: DeviceIdentity,
    /// Catalog name of the profile
    pub profile_name: String,
    /// Profile the slice was created from
    pub profile: Profile,
    /// Requested placement
    pub placement: Placement,
    /// Current lifecycle state
    #[serde(flatten)]
    pub state: SliceState,
    /// Whether the GPU instance was reused from a previous run
    pub recovered: bool,
}

impl Slice {
    pub fn gi(&self) -> Option<u32> {
        self.state.gi()
    }

    pub fn ci(&self) -> Option<u32> {
        self.state.ci()
    }

    /// Workloads may only attach to a ready slice
    pub fn is_ready(&self) -> bool {
        matches!(self.state, SliceState::Ready { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placement_for_profile() {
        let profile = Profile::new(2, 2, 4);
        let placement = Placement::for_profile(&profile, 4);
        assert_eq!(placement, Placement::new(4, 4));
        assert_eq!(placement.to_string(), "{start: 4, size: 4}");
    }

    #[test]
    fn test_device_selector_parse() {
        assert_eq!(
            "0".parse::<DeviceSelector>().unwrap(),
            DeviceSelector::Index(0)
        );
        assert_eq!(
            "GPU-5d3f-aa".parse::<DeviceSelector>().unwrap(),
            DeviceSelector::Uuid("GPU-5d3f-aa".to_string())
        );
        assert!("  ".parse::<DeviceSelector>().is_err());
    }

    #[test]
    fn test_slice_state_ids() {
        assert_eq!(SliceState::Absent.gi(), None);
        assert_eq!(SliceState::GpuInstanceOnly { gi: 2 }.ci(), None);
        assert_eq!(SliceState::Ready { gi: 2, ci: 0 }.gi(), Some(2));
        assert_eq!(SliceState::Ready { gi: 2, ci: 0 }.ci(), Some(0));
        assert_eq!(SliceState::ComputeDestroyed { gi: 5 }.gi(), Some(5));
    }

    #[test]
    fn test_slice_serializes_state_inline() {
        let slice = Slice {
            device: DeviceIdentity::new("GPU-0"),
            profile_name: "1g.5gb".to_string(),
            profile: Profile::new(0, 0, 1),
            placement: Placement::new(0, 1),
            state: SliceState::Ready { gi: 7, ci: 0 },
            recovered: false,
        };
        let json = serde_json::to_value(&slice).unwrap();
        assert_eq!(json["state"], "ready");
        assert_eq!(json["gi"], 7);
        assert_eq!(json["device"], "GPU-0");
        assert!(slice.is_ready());
    }
}
