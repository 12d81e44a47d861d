use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AnnotatorError {
    #[error("invalid genomic unit type: {0}")]
    InvalidGenomicUnitType(String),

    #[error("missing config file at {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid setting {name}: {message}")]
    InvalidSetting { name: String, message: String },

    #[error("failed to read catalog at {0}")]
    CatalogRead(PathBuf),

    #[error("failed to parse catalog: {0}")]
    CatalogParse(String),

    #[error("invalid dataset {data_set}: {message}")]
    InvalidDataset { data_set: String, message: String },

    #[error("failed to read analysis at {0}")]
    AnalysisRead(PathBuf),

    #[error("failed to parse analysis: {0}")]
    AnalysisParse(String),

    #[error("invalid query `{query}`: {message}")]
    QueryParse { query: String, message: String },

    #[error("query evaluation failed: {0}")]
    QueryEval(String),

    #[error("template `{template}` references unknown placeholder `{placeholder}`")]
    TemplatePlaceholder {
        template: String,
        placeholder: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("HTTP request returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("failed to decode JSON response: {0}")]
    Json(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("failed to parse delimited output: {0}")]
    Delimited(String),

    #[error("version unavailable: {0}")]
    VersionUnavailable(String),

    #[error("annotation store error: {0}")]
    Store(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("worker pool error: {0}")]
    WorkerPool(String),

    #[error("task panicked: {0}")]
    TaskPanicked(String),
}
