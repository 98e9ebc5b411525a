//! Error types for dynamig

use crate::slice::{Placement, SliceState};
use thiserror::Error;

/// Failure reported by the device driver boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The requested device, instance or profile does not exist
    #[error("not found")]
    NotFound,

    /// The requested template's resource pool is fully subscribed
    #[error("insufficient resources")]
    InsufficientResources,

    /// Any other driver status, with its raw code
    #[error("driver returned {code}: {message}")]
    Rejected { code: u32, message: String },
}

impl DriverError {
    /// Build a generic rejection
    pub fn rejected(code: u32, message: impl Into<String>) -> Self {
        DriverError::Rejected {
            code,
            message: message.into(),
        }
    }

    /// Raw driver code, when the driver supplied one
    pub fn code(&self) -> Option<u32> {
        match self {
            DriverError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Driver call that produced an error, used for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DeviceLookup,
    DeviceIdentity,
    CreateInstance,
    ListInstances,
    InstanceInfo,
    InstanceLookup,
    SubTemplateInfo,
    CreateSubInstance,
    ListSubInstances,
    SubInstanceLookup,
    DestroySubInstance,
    DestroyInstance,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::DeviceLookup => "device lookup",
            Operation::DeviceIdentity => "device identity query",
            Operation::CreateInstance => "GPU instance creation",
            Operation::ListInstances => "GPU instance enumeration",
            Operation::InstanceInfo => "GPU instance info query",
            Operation::InstanceLookup => "GPU instance lookup",
            Operation::SubTemplateInfo => "compute profile info query",
            Operation::CreateSubInstance => "compute instance creation",
            Operation::ListSubInstances => "compute instance enumeration",
            Operation::SubInstanceLookup => "compute instance lookup",
            Operation::DestroySubInstance => "compute instance destruction",
            Operation::DestroyInstance => "GPU instance destruction",
        };
        f.write_str(name)
    }
}

/// Abstract error category, independent of driver status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DeviceNotFound,
    InstanceNotFound,
    ResourceExhausted,
    PartitionUnavailable,
    DriverRejected,
    ProfileNotFound,
    InvalidPlacement,
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::DeviceNotFound => "DeviceNotFound",
            ErrorKind::InstanceNotFound => "InstanceNotFound",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::PartitionUnavailable => "PartitionUnavailable",
            ErrorKind::DriverRejected => "DriverRejected",
            ErrorKind::ProfileNotFound => "ProfileNotFound",
            ErrorKind::InvalidPlacement => "InvalidPlacement",
            ErrorKind::Config => "Config",
        };
        f.write_str(name)
    }
}

/// Main error type for dynamig
#[derive(Error, Debug)]
pub enum MigError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Profile name not present in the active catalog
    #[error("Profile not found: {name} (catalog {catalog})")]
    ProfileNotFound { name: String, catalog: String },

    /// Placement width differs from the profile's slot width
    #[error("Invalid placement {placement} for profile {profile}: expected size {slot_width}")]
    InvalidPlacement {
        profile: String,
        placement: Placement,
        slot_width: u32,
    },

    /// Device index or UUID does not resolve
    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    /// GPU or compute instance id does not resolve under its parent
    #[error("Instance not found: {instance}")]
    InstanceNotFound { instance: String },

    /// Resources exhausted and no existing partition matches the placement
    #[error("Partition unavailable: no capacity for profile {profile} at placement {placement} on {device} and no matching instance to reuse")]
    PartitionUnavailable {
        device: String,
        profile: String,
        placement: Placement,
    },

    /// Any other driver failure
    #[error("Driver rejected {operation} for {target}: {source}")]
    DriverRejected {
        operation: Operation,
        target: String,
        #[source]
        source: DriverError,
    },

    /// A lifecycle step failed after the device was already mutated
    #[error("Slice left in state {state}: {source}")]
    Incomplete {
        state: SliceState,
        #[source]
        source: Box<MigError>,
    },
}

/// Result type for dynamig operations
pub type MigResult<T> = Result<T, MigError>;

impl MigError {
    /// Shorthand for a driver rejection
    pub fn driver(operation: Operation, target: impl Into<String>, source: DriverError) -> Self {
        MigError::DriverRejected {
            operation,
            target: target.into(),
            source,
        }
    }

    /// Wrap this error with the slice state the device was left in
    pub fn incomplete(self, state: SliceState) -> Self {
        MigError::Incomplete {
            state,
            source: Box::new(self),
        }
    }

    /// Abstract category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigError::Config(_) => ErrorKind::Config,
            MigError::ProfileNotFound { .. } => ErrorKind::ProfileNotFound,
            MigError::InvalidPlacement { .. } => ErrorKind::InvalidPlacement,
            MigError::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            MigError::InstanceNotFound { .. } => ErrorKind::InstanceNotFound,
            MigError::PartitionUnavailable { .. } => ErrorKind::PartitionUnavailable,
            MigError::DriverRejected {
                operation: Operation::CreateInstance | Operation::CreateSubInstance,
                source: DriverError::InsufficientResources,
                ..
            } => ErrorKind::ResourceExhausted,
            MigError::DriverRejected { .. } => ErrorKind::DriverRejected,
            MigError::Incomplete { source, .. } => source.kind(),
        }
    }

    /// Slice state left behind by a partial failure, if any
    pub fn slice_state(&self) -> Option<SliceState> {
        match self {
            MigError::Incomplete { state, .. } => Some(*state),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for MigError {
    fn from(err: toml::de::Error) -> Self {
        MigError::Config(format!("Failed to parse config: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigError::Config("invalid config".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid config");
    }

    #[test]
    fn test_driver_rejection_kind() {
        let err = MigError::driver(
            Operation::DestroyInstance,
            "gi 3 on GPU-0",
            DriverError::rejected(19, "in use"),
        );
        assert_eq!(err.kind(), ErrorKind::DriverRejected);
        assert!(err.to_string().contains("gi 3 on GPU-0"));
        assert!(err.to_string().contains("19"));
    }

    #[test]
    fn test_exhaustion_surfaced_as_resource_exhausted() {
        let err = MigError::driver(
            Operation::CreateInstance,
            "GPU-0",
            DriverError::InsufficientResources,
        );
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_insufficient_resources_outside_creation_is_rejection() {
        for operation in [
            Operation::ListInstances,
            Operation::DestroySubInstance,
            Operation::DestroyInstance,
        ] {
            let err = MigError::driver(operation, "gi 0", DriverError::InsufficientResources);
            assert_eq!(err.kind(), ErrorKind::DriverRejected);
        }
    }

    #[test]
    fn test_incomplete_delegates_kind() {
        let err = MigError::driver(
            Operation::DestroyInstance,
            "gi 1",
            DriverError::rejected(999, "unknown"),
        )
        .incomplete(SliceState::ComputeDestroyed { gi: 1 });

        assert_eq!(err.kind(), ErrorKind::DriverRejected);
        assert_eq!(err.slice_state(), Some(SliceState::ComputeDestroyed { gi: 1 }));
        assert!(err.to_string().contains("gi 1"));
    }

    #[test]
    fn test_driver_error_code() {
        assert_eq!(DriverError::rejected(3, "not supported").code(), Some(3));
        assert_eq!(DriverError::NotFound.code(), None);
    }
}
