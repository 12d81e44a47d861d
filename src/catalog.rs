use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{GenomicUnitType, TRANSCRIPT_ID_DATASET};
use crate::error::AnnotatorError;
use crate::query::Query;
use crate::template;

pub const DEFAULT_VERSION_ATTRIBUTE: &str = ".releases";
pub const DEFAULT_DELIMITER: u8 = b'\t';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Http,
    Forge,
    None,
    Csv,
    Subprocess,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Http => write!(f, "http"),
            SourceType::Forge => write!(f, "forge"),
            SourceType::None => write!(f, "none"),
            SourceType::Csv => write!(f, "csv"),
            SourceType::Subprocess => write!(f, "subprocess"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersioningType {
    Rest,
    Date,
    Rosalution,
}

impl fmt::Display for VersioningType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersioningType::Rest => write!(f, "rest"),
            VersioningType::Date => write!(f, "date"),
            VersioningType::Rosalution => write!(f, "rosalution"),
        }
    }
}

/// One catalog entry. Shared read-only between every unit annotating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub data_set: String,
    pub data_source: String,
    pub genomic_unit_type: GenomicUnitType,
    pub annotation_source_type: SourceType,
    pub versioning_type: VersioningType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub transcript: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_attribute: Option<String>,
}

impl DatasetConfig {
    /// Field separator of subprocess output. Validation guarantees one byte.
    pub fn delimiter(&self) -> u8 {
        self.delimiter
            .as_deref()
            .and_then(|delimiter| delimiter.as_bytes().first().copied())
            .unwrap_or(DEFAULT_DELIMITER)
    }

    pub fn version_attribute(&self) -> &str {
        self.version_attribute
            .as_deref()
            .unwrap_or(DEFAULT_VERSION_ATTRIBUTE)
    }

    fn invalid(&self, message: impl Into<String>) -> AnnotatorError {
        AnnotatorError::InvalidDataset {
            data_set: self.data_set.clone(),
            message: message.into(),
        }
    }

    fn require<'a>(&self, field: &'a Option<String>, name: &str) -> Result<&'a str, AnnotatorError> {
        field
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                self.invalid(format!(
                    "{} datasets require `{name}`",
                    self.annotation_source_type
                ))
            })
    }

    /// Checks the fields the dataset's source and versioning types rely on.
    pub fn validate(&self) -> Result<(), AnnotatorError> {
        if self.data_set.trim().is_empty() {
            return Err(self.invalid("`data_set` must not be empty"));
        }
        if self.data_source.trim().is_empty() {
            return Err(self.invalid("`data_source` must not be empty"));
        }

        let template = match self.annotation_source_type {
            SourceType::Http => {
                self.require(&self.attribute, "attribute")?;
                Some(self.require(&self.url, "url")?)
            }
            SourceType::Forge => Some(self.require(&self.base_string, "base_string")?),
            SourceType::Subprocess => {
                self.require(&self.attribute, "attribute")?;
                Some(self.require(&self.command, "command")?)
            }
            SourceType::None | SourceType::Csv => None,
        };

        if let Some(template) = template {
            let type_name = self.genomic_unit_type.as_str();
            for placeholder in template::placeholders(template) {
                if placeholder != type_name && !self.dependencies.contains(&placeholder) {
                    return Err(self.invalid(format!(
                        "placeholder `{placeholder}` is neither `{type_name}` nor a declared dependency"
                    )));
                }
            }
        }

        if let Some(attribute) = &self.attribute {
            Query::parse(attribute)?;
        }

        if self.versioning_type == VersioningType::Rest {
            let version_url = self.version_url.as_deref().unwrap_or_default();
            if version_url.trim().is_empty() {
                return Err(self.invalid("rest versioning requires `version_url`"));
            }
            // One version is resolved per dataset, never per unit.
            if let Some(placeholder) = template::placeholders(version_url).first() {
                return Err(self.invalid(format!(
                    "`version_url` must not reference placeholder `{placeholder}`"
                )));
            }
            Query::parse(self.version_attribute())?;
        }

        if let Some(delimiter) = &self.delimiter {
            if delimiter.len() != 1 {
                return Err(self.invalid("`delimiter` must be a single byte"));
            }
        }

        Ok(())
    }
}

/// Datasets grouped by the genomic unit type they annotate, in file order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    datasets: BTreeMap<GenomicUnitType, Vec<Arc<DatasetConfig>>>,
}

impl Catalog {
    pub fn new(datasets: Vec<DatasetConfig>) -> Result<Self, AnnotatorError> {
        let mut grouped: BTreeMap<GenomicUnitType, Vec<Arc<DatasetConfig>>> = BTreeMap::new();
        for dataset in datasets {
            dataset.validate()?;
            grouped
                .entry(dataset.genomic_unit_type)
                .or_default()
                .push(Arc::new(dataset));
        }

        for (unit_type, datasets) in &grouped {
            let mut names = HashSet::new();
            for dataset in datasets {
                if !names.insert(dataset.data_set.as_str()) {
                    return Err(dataset.invalid(format!(
                        "dataset is declared twice for {unit_type}"
                    )));
                }
            }
            for dataset in datasets {
                for dependency in &dataset.dependencies {
                    if !names.contains(dependency.as_str()) {
                        return Err(dataset.invalid(format!(
                            "dependency `{dependency}` is not a {unit_type} dataset"
                        )));
                    }
                }
            }
        }

        Ok(Self { datasets: grouped })
    }

    pub fn for_unit_type(&self, unit_type: GenomicUnitType) -> &[Arc<DatasetConfig>] {
        self.datasets
            .get(&unit_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn unit_types(&self) -> impl Iterator<Item = GenomicUnitType> + '_ {
        self.datasets.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.datasets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the unit type has a dataset provisioning transcripts.
    pub fn provisions_transcripts(&self, unit_type: GenomicUnitType) -> bool {
        self.for_unit_type(unit_type)
            .iter()
            .any(|dataset| dataset.data_set == TRANSCRIPT_ID_DATASET)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogSummary {
    pub datasets: usize,
    pub by_unit_type: BTreeMap<String, Vec<String>>,
}

impl From<&Catalog> for CatalogSummary {
    fn from(catalog: &Catalog) -> Self {
        let by_unit_type = catalog
            .datasets
            .iter()
            .map(|(unit_type, datasets)| {
                (
                    unit_type.to_string(),
                    datasets.iter().map(|dataset| dataset.data_set.clone()).collect(),
                )
            })
            .collect();
        Self {
            datasets: catalog.len(),
            by_unit_type,
        }
    }
}

pub struct CatalogLoader;

impl CatalogLoader {
    pub fn load(path: &Path) -> Result<Catalog, AnnotatorError> {
        let content =
            fs::read_to_string(path).map_err(|_| AnnotatorError::CatalogRead(path.to_path_buf()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Catalog, AnnotatorError> {
        let datasets: Vec<DatasetConfig> = serde_json::from_str(content)
            .map_err(|err| AnnotatorError::CatalogParse(err.to_string()))?;
        Self::resolve(datasets)
    }

    pub fn resolve(datasets: Vec<DatasetConfig>) -> Result<Catalog, AnnotatorError> {
        let catalog = Catalog::new(datasets)?;
        for unit_type in catalog.unit_types() {
            let needs_transcripts = catalog
                .for_unit_type(unit_type)
                .iter()
                .any(|dataset| dataset.transcript && dataset.data_set != TRANSCRIPT_ID_DATASET);
            if needs_transcripts && !catalog.provisions_transcripts(unit_type) {
                tracing::warn!(
                    unit_type = %unit_type,
                    "transcript datasets declared without a `{TRANSCRIPT_ID_DATASET}` dataset; they will never become ready"
                );
            }
        }
        Ok(catalog)
    }
}
