use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::catalog::DatasetConfig;
use crate::config::DEFAULT_MAX_RETRIES;
use crate::domain::{GenomicUnit, ManifestEntry, TRANSCRIPT_ID_DATASET};

/// One genomic unit paired with one dataset, moving through the scheduler.
#[derive(Debug, Clone)]
pub struct AnnotationUnit {
    genomic_unit: GenomicUnit,
    dataset: Arc<DatasetConfig>,
    analysis_name: String,
    version: String,
    transcript_provisioned: bool,
    retries: u32,
    retry_limit: u32,
}

impl AnnotationUnit {
    pub fn new(
        genomic_unit: GenomicUnit,
        dataset: Arc<DatasetConfig>,
        analysis_name: impl Into<String>,
    ) -> Self {
        Self {
            genomic_unit,
            dataset,
            analysis_name: analysis_name.into(),
            version: String::new(),
            transcript_provisioned: false,
            retries: 0,
            retry_limit: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn genomic_unit(&self) -> &GenomicUnit {
        &self.genomic_unit
    }

    pub fn dataset(&self) -> &DatasetConfig {
        &self.dataset
    }

    pub fn data_set(&self) -> &str {
        &self.dataset.data_set
    }

    pub fn analysis_name(&self) -> &str {
        &self.analysis_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn version_exists(&self) -> bool {
        !self.version.is_empty()
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.version = version.into();
    }

    /// `{data_source, version}` this unit annotates at. Empty version while
    /// unresolved.
    pub fn manifest_entry(&self) -> ManifestEntry {
        ManifestEntry {
            data_source: self.dataset.data_source.clone(),
            version: self.version.clone(),
        }
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dataset.dependencies.is_empty()
    }

    pub fn missing_dependencies(&self) -> Vec<&str> {
        self.dataset
            .dependencies
            .iter()
            .filter(|name| !self.genomic_unit.has_value(name))
            .map(String::as_str)
            .collect()
    }

    /// Missing dependencies plus the transcript dataset when provisioning is
    /// still outstanding.
    pub fn missing_conditions(&self) -> Vec<&str> {
        let mut missing = self.missing_dependencies();
        if self.needs_transcript_provisioning() && !self.transcript_provisioned {
            missing.push(TRANSCRIPT_ID_DATASET);
        }
        missing
    }

    pub fn set_dependency_value(&mut self, name: impl Into<String>, value: Value) {
        self.genomic_unit.set_value(name, value);
    }

    pub fn is_transcript_dataset(&self) -> bool {
        self.dataset.transcript
    }

    pub fn needs_transcript_provisioning(&self) -> bool {
        self.is_transcript_dataset() && self.dataset.data_set != TRANSCRIPT_ID_DATASET
    }

    pub fn transcript_provisioned(&self) -> bool {
        self.transcript_provisioned
    }

    pub fn set_transcript_provisioned(&mut self, provisioned: bool) {
        self.transcript_provisioned = provisioned;
    }

    pub fn ready_to_annotate(&self) -> bool {
        self.missing_conditions().is_empty()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Counts another attempt. False once the attempts exceed the retry limit.
    pub fn advance_retry_and_check(&mut self) -> bool {
        self.retries += 1;
        self.retries <= self.retry_limit
    }
}

impl fmt::Display for AnnotationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}",
            self.genomic_unit, self.dataset.data_set, self.dataset.data_source
        )?;
        if self.version_exists() {
            write!(f, "@{}", self.version)?;
        }
        Ok(())
    }
}
