use std::collections::HashMap;
use std::fmt;

use crate::catalog::VersioningType;
use crate::unit::AnnotationUnit;

/// Identity of one version resolution within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionKey {
    pub data_set: String,
    pub data_source: String,
    pub versioning_type: VersioningType,
}

impl VersionKey {
    pub fn for_unit(unit: &AnnotationUnit) -> Self {
        let dataset = unit.dataset();
        Self {
            data_set: dataset.data_set.clone(),
            data_source: dataset.data_source.clone(),
            versioning_type: dataset.versioning_type,
        }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}",
            self.data_set, self.data_source, self.versioning_type
        )
    }
}

#[derive(Debug)]
enum VersionEntry {
    /// A fetch is in flight; units here wait for its result.
    Pending(Vec<AnnotationUnit>),
    Resolved(String),
    Failed,
}

/// Outcome of asking the cache for a unit's version.
#[derive(Debug)]
pub enum VersionResolution {
    /// First unit for its key: the caller must dispatch a version task.
    Fetch(AnnotationUnit),
    /// Version copied onto the unit from the cache.
    Cached(AnnotationUnit),
    /// Parked until the in-flight fetch completes.
    Waiting,
    /// The fetch for this key already failed during this run.
    Unavailable(AnnotationUnit),
}

/// Per-run version table. At most one fetch is ever pending per key.
#[derive(Debug, Default)]
pub struct VersionCache {
    entries: HashMap<VersionKey, VersionEntry>,
}

impl VersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&mut self, mut unit: AnnotationUnit) -> VersionResolution {
        let key = VersionKey::for_unit(&unit);
        match self.entries.get_mut(&key) {
            None => {
                self.entries.insert(key, VersionEntry::Pending(Vec::new()));
                VersionResolution::Fetch(unit)
            }
            Some(VersionEntry::Resolved(version)) => {
                unit.set_version(version.clone());
                VersionResolution::Cached(unit)
            }
            Some(VersionEntry::Pending(waiting)) => {
                waiting.push(unit);
                VersionResolution::Waiting
            }
            Some(VersionEntry::Failed) => VersionResolution::Unavailable(unit),
        }
    }

    /// Stores the fetched version and hands back the parked units with the
    /// version already set on them.
    pub fn complete(&mut self, key: &VersionKey, version: &str) -> Vec<AnnotationUnit> {
        let previous = self
            .entries
            .insert(key.clone(), VersionEntry::Resolved(version.to_string()));
        let mut waiting = match previous {
            Some(VersionEntry::Pending(waiting)) => waiting,
            _ => Vec::new(),
        };
        for unit in &mut waiting {
            unit.set_version(version);
        }
        waiting
    }

    /// Marks the key as failed for the rest of the run and returns the
    /// parked units.
    pub fn fail(&mut self, key: &VersionKey) -> Vec<AnnotationUnit> {
        match self.entries.insert(key.clone(), VersionEntry::Failed) {
            Some(VersionEntry::Pending(waiting)) => waiting,
            _ => Vec::new(),
        }
    }

    pub fn get(&self, key: &VersionKey) -> Option<&str> {
        match self.entries.get(key) {
            Some(VersionEntry::Resolved(version)) => Some(version),
            _ => None,
        }
    }

    pub fn is_pending(&self, key: &VersionKey) -> bool {
        matches!(self.entries.get(key), Some(VersionEntry::Pending(_)))
    }

    pub fn waiting(&self) -> usize {
        self.entries
            .values()
            .map(|entry| match entry {
                VersionEntry::Pending(waiting) => waiting.len(),
                _ => 0,
            })
            .sum()
    }
}
