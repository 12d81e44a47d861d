use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AnnotatorError;

/// Dataset whose persisted entries provision the transcripts of a variant.
pub const TRANSCRIPT_ID_DATASET: &str = "transcript_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenomicUnitType {
    Gene,
    HgvsVariant,
    Transcript,
}

impl GenomicUnitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenomicUnitType::Gene => "gene",
            GenomicUnitType::HgvsVariant => "hgvs_variant",
            GenomicUnitType::Transcript => "transcript",
        }
    }
}

impl fmt::Display for GenomicUnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenomicUnitType {
    type Err = AnnotatorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "gene" => Ok(GenomicUnitType::Gene),
            "hgvs_variant" => Ok(GenomicUnitType::HgvsVariant),
            "transcript" => Ok(GenomicUnitType::Transcript),
            _ => Err(AnnotatorError::InvalidGenomicUnitType(value.to_string())),
        }
    }
}

/// A gene, variant or transcript plus the dependency values resolved into it.
///
/// Every annotation unit owns its own copy, so values filled in for one
/// dataset never leak into another unit dispatched concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenomicUnit {
    pub unit: String,
    #[serde(rename = "type")]
    pub unit_type: GenomicUnitType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, Value>,
}

impl GenomicUnit {
    pub fn new(unit: impl Into<String>, unit_type: GenomicUnitType) -> Self {
        Self {
            unit: unit.into(),
            unit_type,
            values: BTreeMap::new(),
        }
    }

    pub fn gene(symbol: impl Into<String>) -> Self {
        Self::new(symbol, GenomicUnitType::Gene)
    }

    pub fn variant(hgvs: impl Into<String>) -> Self {
        Self::new(hgvs, GenomicUnitType::HgvsVariant)
    }

    /// Looks up a template placeholder: the unit type name yields the unit
    /// identifier, anything else a resolved dependency value.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if name == self.unit_type.as_str() {
            return Some(Value::String(self.unit.clone()));
        }
        self.values.get(name).cloned()
    }

    pub fn has_value(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn set_value(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Identity of the record in the stores, independent of resolved values.
    pub fn key(&self) -> (GenomicUnitType, &str) {
        (self.unit_type, self.unit.as_str())
    }
}

impl fmt::Display for GenomicUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.unit, self.unit_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub name: String,
    #[serde(default)]
    pub genomic_units: Vec<GenomicUnit>,
}

impl Analysis {
    pub fn new(name: impl Into<String>, genomic_units: Vec<GenomicUnit>) -> Self {
        Self {
            name: name.into(),
            genomic_units,
        }
    }

    /// Genomic units in listing order with repeated `(type, unit)` pairs removed.
    pub fn distinct_units(&self) -> Vec<&GenomicUnit> {
        let mut seen = std::collections::HashSet::new();
        self.genomic_units
            .iter()
            .filter(|unit| seen.insert(unit.key()))
            .collect()
    }
}

/// One normalized value extracted by a task, ready to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationEntry {
    pub data_set: String,
    pub data_source: String,
    pub version: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_id: Option<String>,
}

/// The `{data_source, version}` pinned by an analysis for one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub data_source: String,
    pub version: String,
}
