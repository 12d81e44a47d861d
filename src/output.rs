use std::io::{self, Write};

use serde::Serialize;

use crate::catalog::CatalogSummary;
use crate::orchestrator::DrainReport;
use crate::store::AnnotationDocument;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotateResult {
    pub analysis: String,
    pub store: String,
    pub report: DrainReport,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_annotate(result: &AnnotateResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_catalog(summary: &CatalogSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_document(document: &AnnotationDocument) -> io::Result<()> {
        Self::print_json(document)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct HumanOutput;

impl HumanOutput {
    pub fn print_annotate(result: &AnnotateResult) {
        let report = &result.report;
        println!("analysis {} ({})", result.analysis, result.store);
        println!("  persisted:         {}", report.persisted);
        println!("  entries written:   {}", report.entries_written);
        println!("  already annotated: {}", report.already_annotated);
        println!("  version lookups:   {}", report.version_tasks);
        println!("  delayed:           {}", report.delayed);
        println!("  canceled:          {}", report.canceled);
        println!("  failed:            {}", report.failed);
    }

    pub fn print_catalog(summary: &CatalogSummary) {
        println!("{} datasets", summary.datasets);
        for (unit_type, datasets) in &summary.by_unit_type {
            println!("  {unit_type}: {}", datasets.join(", "));
        }
    }

    pub fn print_document(document: &AnnotationDocument) {
        println!("{} ({})", document.unit, document.unit_type);
        for (data_set, stored) in &document.annotations {
            for item in stored {
                println!(
                    "  {data_set} [{}@{}] {}",
                    item.data_source, item.version, item.value
                );
            }
        }
        for (transcript_id, datasets) in &document.transcripts {
            println!("  transcript {transcript_id}");
            for (data_set, stored) in datasets {
                for item in stored {
                    println!(
                        "    {data_set} [{}@{}] {}",
                        item.data_source, item.version, item.value
                    );
                }
            }
        }
    }
}
