use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{AnnotationEntry, GenomicUnit, GenomicUnitType, ManifestEntry};
use crate::error::AnnotatorError;

/// Annotation values persisted per genomic unit.
pub trait GenomicUnitStore {
    /// Whether `data_set` is stored for the unit at `entry`, either directly
    /// or under any of its transcripts.
    fn annotation_exists(
        &self,
        unit: &GenomicUnit,
        data_set: &str,
        entry: &ManifestEntry,
    ) -> Result<bool, AnnotatorError>;

    /// The unit-level value of `data_set` stored at `entry`.
    fn find_annotation_value(
        &self,
        unit: &GenomicUnit,
        data_set: &str,
        entry: &ManifestEntry,
    ) -> Result<Option<Value>, AnnotatorError>;

    fn annotate(&self, unit: &GenomicUnit, entry: &AnnotationEntry) -> Result<(), AnnotatorError>;

    /// Stores every entry extracted for one unit. Implementations that can
    /// should apply all of them or none, so a failed write never leaves a
    /// partial set that later reads as already annotated.
    fn annotate_all(
        &self,
        unit: &GenomicUnit,
        entries: &[AnnotationEntry],
    ) -> Result<(), AnnotatorError> {
        entries.iter().try_for_each(|entry| self.annotate(unit, entry))
    }
}

/// Per-analysis record of the `{data_source, version}` chosen per dataset.
pub trait ManifestStore {
    fn pinned(&self, analysis: &str, data_set: &str)
    -> Result<Option<ManifestEntry>, AnnotatorError>;

    fn record(
        &self,
        analysis: &str,
        data_set: &str,
        entry: &ManifestEntry,
    ) -> Result<(), AnnotatorError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAnnotation {
    pub data_source: String,
    pub version: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationDocument {
    pub unit: String,
    #[serde(rename = "type")]
    pub unit_type: GenomicUnitType,
    #[serde(default)]
    pub annotations: BTreeMap<String, Vec<StoredAnnotation>>,
    #[serde(default)]
    pub transcripts: BTreeMap<String, BTreeMap<String, Vec<StoredAnnotation>>>,
}

impl AnnotationDocument {
    fn new(unit: &GenomicUnit) -> Self {
        Self {
            unit: unit.unit.clone(),
            unit_type: unit.unit_type,
            annotations: BTreeMap::new(),
            transcripts: BTreeMap::new(),
        }
    }

    fn has(&self, data_set: &str, entry: &ManifestEntry) -> bool {
        let matches = |stored: &Vec<StoredAnnotation>| {
            stored
                .iter()
                .any(|item| item.data_source == entry.data_source && item.version == entry.version)
        };
        self.annotations.get(data_set).is_some_and(matches)
            || self
                .transcripts
                .values()
                .any(|datasets| datasets.get(data_set).is_some_and(matches))
    }

    fn value(&self, data_set: &str, entry: &ManifestEntry) -> Option<Value> {
        self.annotations
            .get(data_set)?
            .iter()
            .find(|item| item.data_source == entry.data_source && item.version == entry.version)
            .map(|item| item.value.clone())
    }

    fn upsert(&mut self, entry: &AnnotationEntry) {
        let stored = match &entry.transcript_id {
            Some(transcript_id) => self
                .transcripts
                .entry(transcript_id.clone())
                .or_default()
                .entry(entry.data_set.clone())
                .or_default(),
            None => self.annotations.entry(entry.data_set.clone()).or_default(),
        };
        let item = StoredAnnotation {
            data_source: entry.data_source.clone(),
            version: entry.version.clone(),
            value: entry.value.clone(),
        };
        match stored.iter().position(|existing| {
            existing.data_source == item.data_source && existing.version == item.version
        }) {
            Some(index) => stored[index] = item,
            None => stored.push(item),
        }
    }
}

fn document_key(unit_type: GenomicUnitType, unit: &str) -> String {
    format!("{unit_type}:{unit}")
}

type Documents = BTreeMap<String, AnnotationDocument>;
type Manifests = BTreeMap<String, BTreeMap<String, ManifestEntry>>;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, AnnotatorError> {
    mutex
        .lock()
        .map_err(|_| AnnotatorError::Store("store lock poisoned".to_string()))
}

/// In-process store for both collaborators. Counts every write it accepts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<Documents>,
    manifests: Mutex<Manifests>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_parts(documents: Documents, manifests: Manifests) -> Self {
        Self {
            documents: Mutex::new(documents),
            manifests: Mutex::new(manifests),
            writes: AtomicUsize::new(0),
        }
    }

    /// Annotation and manifest writes accepted so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn document(
        &self,
        unit_type: GenomicUnitType,
        unit: &str,
    ) -> Result<Option<AnnotationDocument>, AnnotatorError> {
        Ok(lock(&self.documents)?
            .get(&document_key(unit_type, unit))
            .cloned())
    }

    pub fn manifest(
        &self,
        analysis: &str,
    ) -> Result<BTreeMap<String, ManifestEntry>, AnnotatorError> {
        Ok(lock(&self.manifests)?
            .get(analysis)
            .cloned()
            .unwrap_or_default())
    }

    fn snapshot(&self) -> Result<(Documents, Manifests), AnnotatorError> {
        Ok((lock(&self.documents)?.clone(), lock(&self.manifests)?.clone()))
    }

    fn restore_documents(&self, documents: Documents) -> Result<(), AnnotatorError> {
        *lock(&self.documents)? = documents;
        Ok(())
    }
}

impl GenomicUnitStore for MemoryStore {
    fn annotation_exists(
        &self,
        unit: &GenomicUnit,
        data_set: &str,
        entry: &ManifestEntry,
    ) -> Result<bool, AnnotatorError> {
        Ok(lock(&self.documents)?
            .get(&document_key(unit.unit_type, &unit.unit))
            .is_some_and(|document| document.has(data_set, entry)))
    }

    fn find_annotation_value(
        &self,
        unit: &GenomicUnit,
        data_set: &str,
        entry: &ManifestEntry,
    ) -> Result<Option<Value>, AnnotatorError> {
        Ok(lock(&self.documents)?
            .get(&document_key(unit.unit_type, &unit.unit))
            .and_then(|document| document.value(data_set, entry)))
    }

    fn annotate(&self, unit: &GenomicUnit, entry: &AnnotationEntry) -> Result<(), AnnotatorError> {
        self.annotate_all(unit, std::slice::from_ref(entry))
    }

    fn annotate_all(
        &self,
        unit: &GenomicUnit,
        entries: &[AnnotationEntry],
    ) -> Result<(), AnnotatorError> {
        let mut documents = lock(&self.documents)?;
        let document = documents
            .entry(document_key(unit.unit_type, &unit.unit))
            .or_insert_with(|| AnnotationDocument::new(unit));
        for entry in entries {
            document.upsert(entry);
        }
        self.writes.fetch_add(entries.len(), Ordering::SeqCst);
        Ok(())
    }
}

impl ManifestStore for MemoryStore {
    fn pinned(
        &self,
        analysis: &str,
        data_set: &str,
    ) -> Result<Option<ManifestEntry>, AnnotatorError> {
        Ok(lock(&self.manifests)?
            .get(analysis)
            .and_then(|datasets| datasets.get(data_set))
            .cloned())
    }

    fn record(
        &self,
        analysis: &str,
        data_set: &str,
        entry: &ManifestEntry,
    ) -> Result<(), AnnotatorError> {
        lock(&self.manifests)?
            .entry(analysis.to_string())
            .or_default()
            .insert(data_set.to_string(), entry.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// [`MemoryStore`] persisted as JSON under a root directory. Every write is
/// flushed with a temp file and rename.
#[derive(Debug)]
pub struct JsonFileStore {
    root: Utf8PathBuf,
    inner: MemoryStore,
}

impl JsonFileStore {
    pub fn open(root: Utf8PathBuf) -> Result<Self, AnnotatorError> {
        fs::create_dir_all(root.as_std_path())
            .map_err(|err| AnnotatorError::Filesystem(err.to_string()))?;
        let documents: Documents = read_json(&root.join(ANNOTATIONS_FILE))?;
        let manifests: Manifests = read_json(&root.join(MANIFESTS_FILE))?;
        Ok(Self {
            root,
            inner: MemoryStore::from_parts(documents, manifests),
        })
    }

    /// Platform data directory, e.g. `~/.local/share/genomic-annotator`.
    pub fn default_root() -> Result<Utf8PathBuf, AnnotatorError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("genomic-annotator")).ok()
            })
            .ok_or_else(|| {
                AnnotatorError::Filesystem("unable to resolve data directory".to_string())
            })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn annotations_path(&self) -> Utf8PathBuf {
        self.root.join(ANNOTATIONS_FILE)
    }

    pub fn manifests_path(&self) -> Utf8PathBuf {
        self.root.join(MANIFESTS_FILE)
    }

    pub fn document(
        &self,
        unit_type: GenomicUnitType,
        unit: &str,
    ) -> Result<Option<AnnotationDocument>, AnnotatorError> {
        self.inner.document(unit_type, unit)
    }

    pub fn manifest(
        &self,
        analysis: &str,
    ) -> Result<BTreeMap<String, ManifestEntry>, AnnotatorError> {
        self.inner.manifest(analysis)
    }

    pub fn writes(&self) -> usize {
        self.inner.writes()
    }

    fn flush(&self) -> Result<(), AnnotatorError> {
        let (documents, manifests) = self.inner.snapshot()?;
        write_json_atomic(&self.annotations_path(), &documents)?;
        write_json_atomic(&self.manifests_path(), &manifests)
    }
}

impl GenomicUnitStore for JsonFileStore {
    fn annotation_exists(
        &self,
        unit: &GenomicUnit,
        data_set: &str,
        entry: &ManifestEntry,
    ) -> Result<bool, AnnotatorError> {
        self.inner.annotation_exists(unit, data_set, entry)
    }

    fn find_annotation_value(
        &self,
        unit: &GenomicUnit,
        data_set: &str,
        entry: &ManifestEntry,
    ) -> Result<Option<Value>, AnnotatorError> {
        self.inner.find_annotation_value(unit, data_set, entry)
    }

    fn annotate(&self, unit: &GenomicUnit, entry: &AnnotationEntry) -> Result<(), AnnotatorError> {
        self.annotate_all(unit, std::slice::from_ref(entry))
    }

    /// Rolls the in-memory documents back when the flush fails, so memory
    /// and disk agree that none of the entries were stored.
    fn annotate_all(
        &self,
        unit: &GenomicUnit,
        entries: &[AnnotationEntry],
    ) -> Result<(), AnnotatorError> {
        let (previous, _) = self.inner.snapshot()?;
        self.inner.annotate_all(unit, entries)?;
        if let Err(err) = self.flush() {
            self.inner.restore_documents(previous)?;
            return Err(err);
        }
        Ok(())
    }
}

impl ManifestStore for JsonFileStore {
    fn pinned(
        &self,
        analysis: &str,
        data_set: &str,
    ) -> Result<Option<ManifestEntry>, AnnotatorError> {
        self.inner.pinned(analysis, data_set)
    }

    fn record(
        &self,
        analysis: &str,
        data_set: &str,
        entry: &ManifestEntry,
    ) -> Result<(), AnnotatorError> {
        self.inner.record(analysis, data_set, entry)?;
        self.flush()
    }
}

const ANNOTATIONS_FILE: &str = "annotations.json";
const MANIFESTS_FILE: &str = "manifests.json";

fn read_json<T: DeserializeOwned + Default>(path: &Utf8Path) -> Result<T, AnnotatorError> {
    if !path.as_std_path().exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| AnnotatorError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_str(&content)
        .map_err(|err| AnnotatorError::Store(format!("corrupt {path}: {err}")))
}

fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), AnnotatorError> {
    let parent = path
        .parent()
        .ok_or_else(|| AnnotatorError::Filesystem("invalid destination path".to_string()))?;
    let content = serde_json::to_vec_pretty(value)
        .map_err(|err| AnnotatorError::Store(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix("genomic-annotator")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| AnnotatorError::Filesystem(err.to_string()))?;
    temp.write_all(&content)
        .map_err(|err| AnnotatorError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| AnnotatorError::Filesystem(err.to_string()))?;
    Ok(())
}
