use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use genomic_annotator::catalog::{Catalog, CatalogLoader};
use genomic_annotator::client::{CommandRunner, HttpFetcher};
use genomic_annotator::config::SchedulerSettings;
use genomic_annotator::domain::{
    Analysis, AnnotationEntry, GenomicUnit, GenomicUnitType, ManifestEntry,
};
use genomic_annotator::error::AnnotatorError;
use genomic_annotator::orchestrator::{DrainReport, Orchestrator};
use genomic_annotator::queue::{AnnotationQueue, seed_with_retry_limit};
use genomic_annotator::store::{GenomicUnitStore, ManifestStore, MemoryStore};
use genomic_annotator::task::TaskContext;
use genomic_annotator::unit::AnnotationUnit;

#[derive(Default)]
struct MockHttp {
    responses: HashMap<String, Value>,
    calls: Mutex<Vec<String>>,
}

impl MockHttp {
    fn with(mut self, url: &str, body: Value) -> Self {
        self.responses.insert(url.to_string(), body);
        self
    }

    fn calls_to(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|called| called.as_str() == url)
            .count()
    }
}

impl HttpFetcher for MockHttp {
    fn get_json(&self, url: &str) -> Result<Value, AnnotatorError> {
        self.calls.lock().unwrap().push(url.to_string());
        if url.contains("panic") {
            panic!("mock exploded on {url}");
        }
        self.responses
            .get(url)
            .cloned()
            .ok_or_else(|| AnnotatorError::HttpStatus {
                status: 404,
                message: url.to_string(),
            })
    }
}

/// Lets a test keep a handle on the mock after the orchestrator takes it.
struct SharedHttp(Arc<MockHttp>);

impl HttpFetcher for SharedHttp {
    fn get_json(&self, url: &str) -> Result<Value, AnnotatorError> {
        self.0.get_json(url)
    }
}

#[derive(Default)]
struct MockCommands {
    stdout: String,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl CommandRunner for MockCommands {
    fn run(&self, program: &str, args: &[String]) -> Result<String, AnnotatorError> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));
        Ok(self.stdout.clone())
    }
}

fn settings() -> SchedulerSettings {
    SchedulerSettings {
        workers: 3,
        max_retries: 10,
        retry_delay: Duration::from_millis(5),
        max_retry_delay: Duration::from_millis(20),
    }
}

fn catalog(datasets: Value) -> Catalog {
    CatalogLoader::parse(&datasets.to_string()).unwrap()
}

fn drain_with(
    http: MockHttp,
    commands: MockCommands,
    catalog: &Catalog,
    analysis: &Analysis,
    store: &MemoryStore,
    retry_limit: u32,
) -> DrainReport {
    let ctx = TaskContext::new(http, commands).with_none_task_max_delay(Duration::from_millis(5));
    let orchestrator = Orchestrator::new(ctx, settings());
    let queue = seed_with_retry_limit(analysis, catalog, retry_limit);
    let report = orchestrator.drain(&queue, store, store).unwrap();
    assert!(queue.is_empty());
    report
}

fn gene_catalog() -> Catalog {
    catalog(json!([
        {
            "data_set": "Entrez Gene Id",
            "data_source": "HGNC",
            "genomic_unit_type": "gene",
            "annotation_source_type": "http",
            "versioning_type": "rest",
            "url": "https://genes.test/symbol/{gene}",
            "attribute": "{\"Entrez Gene Id\": .entrez}",
            "version_url": "https://genes.test/info",
            "version_attribute": ".release"
        },
        {
            "data_set": "HPO",
            "data_source": "HPO",
            "genomic_unit_type": "gene",
            "annotation_source_type": "http",
            "versioning_type": "rosalution",
            "url": "https://hpo.test/gene/{Entrez Gene Id}",
            "attribute": "{HPO: .terms}",
            "dependencies": ["Entrez Gene Id"]
        }
    ]))
}

fn gene_http() -> MockHttp {
    MockHttp::default()
        .with("https://genes.test/info", json!({"release": "2024-06"}))
        .with("https://genes.test/symbol/VMA21", json!({"entrez": 45614}))
        .with("https://genes.test/symbol/LMNA", json!({"entrez": 4000}))
        .with("https://hpo.test/gene/45614", json!({"terms": ["HP:0003198"]}))
        .with("https://hpo.test/gene/4000", json!({"terms": ["HP:0001638"]}))
}

#[test]
fn dependent_dataset_uses_resolved_value() {
    let catalog = gene_catalog();
    let analysis = Analysis::new("CPAM0002", vec![GenomicUnit::gene("VMA21")]);
    let store = MemoryStore::new();

    let report =
        drain_with(gene_http(), MockCommands::default(), &catalog, &analysis, &store, 10);

    assert_eq!(report.persisted, 2);
    assert_eq!(report.canceled, 0);
    assert_eq!(report.failed, 0);

    let document = store
        .document(GenomicUnitType::Gene, "VMA21")
        .unwrap()
        .unwrap();
    assert_eq!(document.annotations["Entrez Gene Id"][0].value, json!(45614));
    assert_eq!(document.annotations["Entrez Gene Id"][0].version, "2024-06");
    assert_eq!(document.annotations["HPO"][0].value, json!(["HP:0003198"]));
    assert_eq!(document.annotations["HPO"][0].version, "rosalution-manifest-00");

    let manifest = store.manifest("CPAM0002").unwrap();
    assert_eq!(manifest["Entrez Gene Id"].version, "2024-06");
    assert_eq!(manifest["HPO"].data_source, "HPO");
}

#[test]
fn dependent_dataset_requests_rendered_url() {
    let catalog = gene_catalog();
    let analysis = Analysis::new("CPAM0002", vec![GenomicUnit::gene("VMA21")]);
    let store = MemoryStore::new();
    let http = Arc::new(gene_http());
    let ctx = TaskContext::new(SharedHttp(Arc::clone(&http)), MockCommands::default());
    let orchestrator = Orchestrator::new(ctx, settings());
    let queue = seed_with_retry_limit(&analysis, &catalog, 10);

    orchestrator.drain(&queue, &store, &store).unwrap();

    assert_eq!(http.calls_to("https://hpo.test/gene/45614"), 1);
    assert_eq!(http.calls_to("https://genes.test/symbol/VMA21"), 1);
}

#[test]
fn version_is_fetched_once_per_dataset() {
    let catalog = gene_catalog();
    let analysis = Analysis::new(
        "CPAM0046",
        vec![GenomicUnit::gene("VMA21"), GenomicUnit::gene("LMNA")],
    );
    let store = MemoryStore::new();
    let http = gene_http();
    let ctx = TaskContext::new(http, MockCommands::default());
    let orchestrator = Orchestrator::new(ctx, settings());
    let queue = seed_with_retry_limit(&analysis, &catalog, 10);

    let report = orchestrator.drain(&queue, &store, &store).unwrap();

    assert_eq!(report.persisted, 4);
    // One lookup per (data_set, data_source, versioning_type).
    assert_eq!(report.version_tasks, 2);
    let lmna = store
        .document(GenomicUnitType::Gene, "LMNA")
        .unwrap()
        .unwrap();
    assert_eq!(lmna.annotations["HPO"][0].value, json!(["HP:0001638"]));
}

#[test]
fn version_endpoint_called_once() {
    let catalog = gene_catalog();
    let analysis = Analysis::new(
        "CPAM0046",
        vec![GenomicUnit::gene("VMA21"), GenomicUnit::gene("LMNA")],
    );
    let store = MemoryStore::new();
    let http = Arc::new(gene_http());
    let ctx = TaskContext::new(SharedHttp(Arc::clone(&http)), MockCommands::default());
    let orchestrator = Orchestrator::new(ctx, settings());
    let queue = seed_with_retry_limit(&analysis, &catalog, 10);

    orchestrator.drain(&queue, &store, &store).unwrap();

    assert_eq!(http.calls_to("https://genes.test/info"), 1);
    assert_eq!(http.calls_to("https://hpo.test/gene/45614"), 1);
    assert_eq!(http.calls_to("https://hpo.test/gene/4000"), 1);
}

#[test]
fn second_drain_writes_nothing() {
    let catalog = gene_catalog();
    let analysis = Analysis::new("CPAM0002", vec![GenomicUnit::gene("VMA21")]);
    let store = MemoryStore::new();

    let first = drain_with(gene_http(), MockCommands::default(), &catalog, &analysis, &store, 10);
    assert_eq!(first.persisted, 2);
    let writes = store.writes();

    let second =
        drain_with(gene_http(), MockCommands::default(), &catalog, &analysis, &store, 10);
    assert_eq!(second.persisted, 0);
    assert_eq!(second.annotation_tasks, 0);
    assert_eq!(second.already_annotated, 2);
    assert_eq!(store.writes(), writes);
}

#[test]
fn dependency_from_earlier_run_is_ready_immediately() {
    let catalog = gene_catalog();
    let analysis = Analysis::new("CPAM0002", vec![GenomicUnit::gene("VMA21")]);
    let store = store_with_entrez_id(&analysis.name, 45614);

    let report = drain_with(gene_http(), MockCommands::default(), &catalog, &analysis, &store, 10);

    assert_eq!(report.delayed, 0);
    assert_eq!(report.already_annotated, 1);
    assert_eq!(report.persisted, 1);
    let document = store
        .document(GenomicUnitType::Gene, "VMA21")
        .unwrap()
        .unwrap();
    assert_eq!(document.annotations["HPO"][0].value, json!(["HP:0003198"]));
}

/// A store already holding `Entrez Gene Id` for VMA21, pinned by `analysis`.
fn store_with_entrez_id(analysis: &str, entrez: u64) -> MemoryStore {
    let store = MemoryStore::new();
    let pinned = ManifestEntry {
        data_source: "HGNC".to_string(),
        version: "2024-06".to_string(),
    };
    store
        .annotate(
            &GenomicUnit::gene("VMA21"),
            &AnnotationEntry {
                data_set: "Entrez Gene Id".to_string(),
                data_source: pinned.data_source.clone(),
                version: pinned.version.clone(),
                value: json!(entrez),
                transcript_id: None,
            },
        )
        .unwrap();
    store.record(analysis, "Entrez Gene Id", &pinned).unwrap();
    store
}

/// Misses the first `Entrez Gene Id` lookup and stores the value while
/// answering it, as if another run persisted it between two passes.
struct LateEntrezStore {
    inner: MemoryStore,
    missed: AtomicBool,
}

impl GenomicUnitStore for LateEntrezStore {
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
        if data_set == "Entrez Gene Id" && !self.missed.swap(true, Ordering::SeqCst) {
            self.inner.annotate(
                unit,
                &AnnotationEntry {
                    data_set: data_set.to_string(),
                    data_source: entry.data_source.clone(),
                    version: entry.version.clone(),
                    value: json!(45614),
                    transcript_id: None,
                },
            )?;
            return Ok(None);
        }
        self.inner.find_annotation_value(unit, data_set, entry)
    }

    fn annotate(&self, unit: &GenomicUnit, entry: &AnnotationEntry) -> Result<(), AnnotatorError> {
        self.inner.annotate(unit, entry)
    }
}

impl ManifestStore for LateEntrezStore {
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
        self.inner.record(analysis, data_set, entry)
    }
}

#[test]
fn dependency_persisted_between_passes_unblocks_next_pass() {
    let catalog = gene_catalog();
    let hpo = Arc::clone(&catalog.for_unit_type(GenomicUnitType::Gene)[1]);
    assert_eq!(hpo.data_set, "HPO");

    let store = LateEntrezStore {
        inner: MemoryStore::new(),
        missed: AtomicBool::new(false),
    };
    let entrez_pin = ManifestEntry {
        data_source: "HGNC".to_string(),
        version: "2024-06".to_string(),
    };
    store
        .record("CPAM0002", "Entrez Gene Id", &entrez_pin)
        .unwrap();

    let queue = AnnotationQueue::new();
    queue.put(AnnotationUnit::new(GenomicUnit::gene("VMA21"), hpo, "CPAM0002"));
    let http = Arc::new(gene_http());
    let ctx = TaskContext::new(SharedHttp(Arc::clone(&http)), MockCommands::default());
    let orchestrator = Orchestrator::new(ctx, settings());

    let report = orchestrator.drain(&queue, &store, &store).unwrap();

    // Pass one finds nothing and re-queues with one retry; pass two dispatches.
    assert_eq!(report.delayed, 1);
    assert_eq!(report.canceled, 0);
    assert_eq!(report.annotation_tasks, 1);
    assert_eq!(report.persisted, 1);
    assert_eq!(http.calls_to("https://hpo.test/gene/45614"), 1);

    let document = store
        .inner
        .document(GenomicUnitType::Gene, "VMA21")
        .unwrap()
        .unwrap();
    assert_eq!(document.annotations["HPO"][0].value, json!(["HP:0003198"]));
    let manifest = store.inner.manifest("CPAM0002").unwrap();
    assert_eq!(manifest["HPO"].version, "rosalution-manifest-00");
    assert_eq!(manifest["Entrez Gene Id"], entrez_pin);
}

#[test]
fn unmet_dependency_is_canceled_after_retry_limit() {
    let catalog = gene_catalog();
    let analysis = Analysis::new("CPAM0002", vec![GenomicUnit::gene("UNKNOWN")]);
    let store = MemoryStore::new();

    let report = drain_with(gene_http(), MockCommands::default(), &catalog, &analysis, &store, 3);

    // The Entrez lookup 404s; HPO waits three times and is dropped on the fourth.
    assert_eq!(report.failed, 1);
    assert_eq!(report.delayed, 3);
    assert_eq!(report.canceled, 1);
    assert_eq!(report.persisted, 0);
    assert!(
        store
            .document(GenomicUnitType::Gene, "UNKNOWN")
            .unwrap()
            .is_none()
    );
}

#[test]
fn panicking_task_is_reported_as_failure() {
    let catalog = catalog(json!([{
        "data_set": "Boom",
        "data_source": "Boom",
        "genomic_unit_type": "gene",
        "annotation_source_type": "http",
        "versioning_type": "rosalution",
        "url": "https://panic.test/{gene}",
        "attribute": "{Boom: .x}"
    }]));
    let analysis = Analysis::new("CPAM0002", vec![GenomicUnit::gene("VMA21")]);
    let store = MemoryStore::new();

    let report = drain_with(MockHttp::default(), MockCommands::default(), &catalog, &analysis, &store, 10);

    assert_eq!(report.failed, 1);
    assert_eq!(report.persisted, 0);
}

#[test]
fn failed_version_cancels_waiting_units() {
    let catalog = catalog(json!([{
        "data_set": "Entrez Gene Id",
        "data_source": "HGNC",
        "genomic_unit_type": "gene",
        "annotation_source_type": "http",
        "versioning_type": "rest",
        "url": "https://genes.test/symbol/{gene}",
        "attribute": "{\"Entrez Gene Id\": .entrez}",
        "version_url": "https://genes.test/missing-info"
    }]));
    let analysis = Analysis::new(
        "CPAM0046",
        vec![
            GenomicUnit::gene("VMA21"),
            GenomicUnit::gene("LMNA"),
            GenomicUnit::gene("SCN5A"),
        ],
    );
    let store = MemoryStore::new();

    let report = drain_with(gene_http(), MockCommands::default(), &catalog, &analysis, &store, 10);

    assert_eq!(report.version_tasks, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.canceled, 2);
    assert_eq!(report.annotation_tasks, 0);
    assert_eq!(store.writes(), 0);
}

const VARIANT: &str = "NM_001017980.3:c.164G>T";

fn vep_response() -> Value {
    json!([{
        "transcript_consequences": [
            {"transcript_id": "NM_001017980.4", "sift_prediction": "deleterious"},
            {"transcript_id": "NM_001363810.1", "sift_prediction": "tolerated"}
        ]
    }])
}

fn vep_dataset(data_set: &str, attribute: &str) -> Value {
    json!({
        "data_set": data_set,
        "data_source": "Ensembl",
        "genomic_unit_type": "hgvs_variant",
        "annotation_source_type": "http",
        "versioning_type": "rosalution",
        "url": "https://vep.test/{hgvs_variant}",
        "attribute": attribute,
        "transcript": true
    })
}

#[test]
fn transcript_datasets_wait_for_transcript_provisioning() {
    let catalog = catalog(json!([
        vep_dataset(
            "SIFT Prediction",
            ".[] | .transcript_consequences[] | {transcript_id, \"SIFT Prediction\": .sift_prediction}"
        ),
        vep_dataset(
            "transcript_id",
            ".[] | .transcript_consequences[] | {transcript_id}"
        )
    ]));
    let analysis = Analysis::new("CPAM0002", vec![GenomicUnit::variant(VARIANT)]);
    let store = MemoryStore::new();
    let http = MockHttp::default().with(&format!("https://vep.test/{VARIANT}"), vep_response());

    let report = drain_with(http, MockCommands::default(), &catalog, &analysis, &store, 10);

    assert_eq!(report.persisted, 2);
    assert_eq!(report.entries_written, 4);
    let document = store
        .document(GenomicUnitType::HgvsVariant, VARIANT)
        .unwrap()
        .unwrap();
    assert!(document.annotations.is_empty());
    assert_eq!(
        document.transcripts["NM_001017980.4"]["SIFT Prediction"][0].value,
        json!("deleterious")
    );
    assert_eq!(
        document.transcripts["NM_001363810.1"]["transcript_id"][0].value,
        json!("NM_001363810.1")
    );
}

#[test]
fn transcript_dataset_without_provisioning_is_canceled() {
    let catalog = catalog(json!([vep_dataset(
        "SIFT Prediction",
        ".[] | .transcript_consequences[] | {transcript_id, \"SIFT Prediction\": .sift_prediction}"
    )]));
    let analysis = Analysis::new("CPAM0002", vec![GenomicUnit::variant(VARIANT)]);
    let store = MemoryStore::new();
    let http = MockHttp::default().with(&format!("https://vep.test/{VARIANT}"), vep_response());

    let report = drain_with(http, MockCommands::default(), &catalog, &analysis, &store, 2);

    assert_eq!(report.delayed, 2);
    assert_eq!(report.canceled, 1);
    assert_eq!(report.annotation_tasks, 0);
}

#[test]
fn forge_dataset_stores_rendered_string() {
    let catalog = catalog(json!([{
        "data_set": "ClinVar Link",
        "data_source": "Rosalution",
        "genomic_unit_type": "hgvs_variant",
        "annotation_source_type": "forge",
        "versioning_type": "rosalution",
        "base_string": "https://clinvar.test/?term={hgvs_variant}"
    }]));
    let analysis = Analysis::new("CPAM0002", vec![GenomicUnit::variant(VARIANT)]);
    let store = MemoryStore::new();

    let report = drain_with(MockHttp::default(), MockCommands::default(), &catalog, &analysis, &store, 10);

    assert_eq!(report.persisted, 1);
    let document = store
        .document(GenomicUnitType::HgvsVariant, VARIANT)
        .unwrap()
        .unwrap();
    assert_eq!(
        document.annotations["ClinVar Link"][0].value,
        json!(format!("https://clinvar.test/?term={VARIANT}"))
    );
}

#[test]
fn none_and_csv_datasets_persist_nothing() {
    let catalog = catalog(json!([
        {
            "data_set": "Placeholder",
            "data_source": "Rosalution",
            "genomic_unit_type": "gene",
            "annotation_source_type": "none",
            "versioning_type": "date"
        },
        {
            "data_set": "Curated Table",
            "data_source": "Rosalution",
            "genomic_unit_type": "gene",
            "annotation_source_type": "csv",
            "versioning_type": "rosalution"
        }
    ]));
    let analysis = Analysis::new("CPAM0002", vec![GenomicUnit::gene("VMA21")]);
    let store = MemoryStore::new();

    let report = drain_with(MockHttp::default(), MockCommands::default(), &catalog, &analysis, &store, 10);

    assert_eq!(report.annotation_tasks, 2);
    assert_eq!(report.persisted, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(store.writes(), 0);
}

#[test]
fn subprocess_dataset_parses_delimited_output() {
    let catalog = catalog(json!([{
        "data_set": "Score",
        "data_source": "local",
        "genomic_unit_type": "gene",
        "annotation_source_type": "subprocess",
        "versioning_type": "rosalution",
        "command": "score-gene --symbol {gene}",
        "attribute": ".[] | {Score: .score}"
    }]));
    let analysis = Analysis::new("CPAM0002", vec![GenomicUnit::gene("VMA21")]);
    let store = MemoryStore::new();
    let commands = MockCommands {
        stdout: "gene\tscore\nVMA21\t0.97\n".to_string(),
        ..MockCommands::default()
    };
    let ctx = TaskContext::new(MockHttp::default(), commands);
    let orchestrator = Orchestrator::new(ctx, settings());
    let queue = seed_with_retry_limit(&analysis, &catalog, 10);

    let report = orchestrator.drain(&queue, &store, &store).unwrap();

    assert_eq!(report.persisted, 1);
    let document = store
        .document(GenomicUnitType::Gene, "VMA21")
        .unwrap()
        .unwrap();
    assert_eq!(document.annotations["Score"][0].value, json!("0.97"));
}
