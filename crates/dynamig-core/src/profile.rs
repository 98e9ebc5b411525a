//! MIG profiles and the static per-model profile catalog

use crate::{MigError, MigResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// Immutable template describing one kind of slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Profile {
    /// GPU instance profile id
    pub gi_template: u32,
    /// Compute instance profile id
    pub ci_template: u32,
    /// Number of placement slots the GPU instance occupies
    pub slot_width: u32,
}

impl Profile {
    pub const fn new(gi_template: u32, ci_template: u32, slot_width: u32) -> Self {
        Self {
            gi_template,
            ci_template,
            slot_width,
        }
    }
}

/// GPU models with a built-in profile table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuModel {
    A100,
    A30,
}

impl std::fmt::Display for GpuModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuModel::A100 => write!(f, "a100"),
            GpuModel::A30 => write!(f, "a30"),
        }
    }
}

impl FromStr for GpuModel {
    type Err = MigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "a100" => Ok(GpuModel::A100),
            "a30" => Ok(GpuModel::A30),
            other => Err(MigError::Config(format!("Unknown GPU model: {}", other))),
        }
    }
}

const A100_PROFILES: &[(&str, Profile)] = &[
    ("1g.5gb", Profile::new(0, 0, 1)),
    ("1g.10gb", Profile::new(9, 9, 2)),
    ("2g.10gb", Profile::new(1, 1, 2)),
    ("3g.20gb", Profile::new(2, 2, 4)),
    ("4g.20gb", Profile::new(3, 3, 4)),
    ("7g.40gb", Profile::new(4, 4, 8)),
];

const A30_PROFILES: &[(&str, Profile)] = &[
    ("1g.6gb", Profile::new(0, 0, 1)),
    ("1g.6gb+me", Profile::new(7, 0, 1)),
    ("2g.12gb", Profile::new(1, 1, 2)),
    ("2g.12gb+me", Profile::new(8, 1, 2)),
    ("4g.24gb", Profile::new(3, 3, 4)),
];

/// Read-only mapping from profile name to profile
#[derive(Debug, Clone)]
pub struct ProfileCatalog {
    name: String,
    profiles: BTreeMap<String, Profile>,
}

impl ProfileCatalog {
    /// Built-in table for a GPU model
    pub fn for_model(model: GpuModel) -> Self {
        let table = match model {
            GpuModel::A100 => A100_PROFILES,
            GpuModel::A30 => A30_PROFILES,
        };
        Self {
            name: model.to_string(),
            profiles: table
                .iter()
                .map(|(name, profile)| (name.to_string(), *profile))
                .collect(),
        }
    }

    pub fn a100() -> Self {
        Self::for_model(GpuModel::A100)
    }

    pub fn a30() -> Self {
        Self::for_model(GpuModel::A30)
    }

    /// Add or replace entries; only used while assembling the catalog at startup
    pub fn with_profiles<I>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Profile)>,
    {
        let mut customized = false;
        for (name, profile) in entries {
            self.profiles.insert(name, profile);
            customized = true;
        }
        if customized && !self.name.ends_with('*') {
            self.name.push('*');
        }
        self
    }

    /// Catalog name, suffixed with `*` when entries were overridden
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lookup(&self, name: &str) -> MigResult<&Profile> {
        self.profiles
            .get(name)
            .ok_or_else(|| MigError::ProfileNotFound {
                name: name.to_string(),
                catalog: self.name.clone(),
            })
    }

    /// Profile names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Profile)> {
        self.profiles.iter().map(|(name, p)| (name.as_str(), p))
    }

    /// Distinct GPU instance templates, ascending
    pub fn gi_templates(&self) -> BTreeSet<u32> {
        self.profiles.values().map(|p| p.gi_template).collect()
    }

    /// First profile (by name) built on the given GPU instance template
    pub fn profile_for_template(&self, gi_template: u32) -> Option<(&str, &Profile)> {
        self.iter().find(|(_, p)| p.gi_template == gi_template)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_a100_lookup() {
        let catalog = ProfileCatalog::a100();
        let profile = catalog.lookup("1g.5gb").unwrap();
        assert_eq!(*profile, Profile::new(0, 0, 1));

        let profile = catalog.lookup("7g.40gb").unwrap();
        assert_eq!(profile.slot_width, 8);
    }

    #[test]
    fn test_lookup_unknown_profile() {
        let catalog = ProfileCatalog::a30();
        let err = catalog.lookup("1g.5gb").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ProfileNotFound);
        assert!(err.to_string().contains("a30"));
    }

    #[test]
    fn test_names_sorted() {
        let catalog = ProfileCatalog::a30();
        let names: Vec<&str> = catalog.names().collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(catalog.len(), 5);
    }

    #[test]
    fn test_overrides_mark_catalog() {
        let catalog = ProfileCatalog::a100()
            .with_profiles(vec![("1g.5gb".to_string(), Profile::new(19, 0, 1))]);
        assert_eq!(catalog.name(), "a100*");
        assert_eq!(catalog.lookup("1g.5gb").unwrap().gi_template, 19);
        assert_eq!(catalog.len(), 6);
    }

    #[test]
    fn test_reverse_template_lookup() {
        let catalog = ProfileCatalog::a30();
        let (name, _) = catalog.profile_for_template(8).unwrap();
        assert_eq!(name, "2g.12gb+me");
        assert!(catalog.profile_for_template(42).is_none());
        assert!(catalog.gi_templates().contains(&7));
    }

    #[test]
    fn test_gpu_model_parse() {
        assert_eq!("A100".parse::<GpuModel>().unwrap(), GpuModel::A100);
        assert!("h100".parse::<GpuModel>().is_err());
    }
}
