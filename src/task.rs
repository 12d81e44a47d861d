//! Annotation tasks: one variant per dataset source type plus the version
//! task. `annotate` runs on a worker thread and may block; `extract` runs on
//! the control thread and turns the raw result into storable entries.

use std::fmt;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use csv::{ReaderBuilder, Trim};
use rand::Rng;
use serde_json::{Map, Value};

use crate::catalog::{SourceType, VersioningType};
use crate::client::{CommandRunner, HttpFetcher};
use crate::domain::AnnotationEntry;
use crate::error::AnnotatorError;
use crate::query::Query;
use crate::template::{self, value_text};
use crate::unit::AnnotationUnit;

pub const ROSALUTION_VERSION: &str = "rosalution-manifest-00";
pub const NOT_IMPLEMENTED: &str = "not implemented";

/// What the workers need to perform tasks.
pub struct TaskContext<H, C> {
    pub http: H,
    pub commands: C,
    pub none_task_max_delay: Duration,
}

impl<H, C> TaskContext<H, C> {
    pub fn new(http: H, commands: C) -> Self {
        Self {
            http,
            commands,
            none_task_max_delay: Duration::from_millis(crate::config::DEFAULT_NONE_TASK_MAX_DELAY_MS),
        }
    }

    pub fn with_none_task_max_delay(mut self, delay: Duration) -> Self {
        self.none_task_max_delay = delay;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Http,
    Forge,
    None,
    Csv,
    Subprocess,
    Version,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Http => write!(f, "http"),
            TaskKind::Forge => write!(f, "forge"),
            TaskKind::None => write!(f, "none"),
            TaskKind::Csv => write!(f, "csv"),
            TaskKind::Subprocess => write!(f, "subprocess"),
            TaskKind::Version => write!(f, "version"),
        }
    }
}

#[derive(Debug)]
pub enum AnnotationTask {
    Http(HttpTask),
    Forge(ForgeTask),
    None(NoneTask),
    Csv(CsvTask),
    Subprocess(SubprocessTask),
    Version(VersionTask),
}

impl AnnotationTask {
    /// Builds the task matching the dataset's source type.
    pub fn for_unit(unit: AnnotationUnit) -> Self {
        match unit.dataset().annotation_source_type {
            SourceType::Http => AnnotationTask::Http(HttpTask { unit }),
            SourceType::Forge => AnnotationTask::Forge(ForgeTask { unit }),
            SourceType::None => AnnotationTask::None(NoneTask { unit }),
            SourceType::Csv => AnnotationTask::Csv(CsvTask { unit }),
            SourceType::Subprocess => AnnotationTask::Subprocess(SubprocessTask { unit }),
        }
    }

    pub fn version_for(unit: AnnotationUnit) -> Self {
        AnnotationTask::Version(VersionTask { unit })
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            AnnotationTask::Http(_) => TaskKind::Http,
            AnnotationTask::Forge(_) => TaskKind::Forge,
            AnnotationTask::None(_) => TaskKind::None,
            AnnotationTask::Csv(_) => TaskKind::Csv,
            AnnotationTask::Subprocess(_) => TaskKind::Subprocess,
            AnnotationTask::Version(_) => TaskKind::Version,
        }
    }

    pub fn unit(&self) -> &AnnotationUnit {
        match self {
            AnnotationTask::Http(task) => &task.unit,
            AnnotationTask::Forge(task) => &task.unit,
            AnnotationTask::None(task) => &task.unit,
            AnnotationTask::Csv(task) => &task.unit,
            AnnotationTask::Subprocess(task) => &task.unit,
            AnnotationTask::Version(task) => &task.unit,
        }
    }

    pub fn into_unit(self) -> AnnotationUnit {
        match self {
            AnnotationTask::Http(task) => task.unit,
            AnnotationTask::Forge(task) => task.unit,
            AnnotationTask::None(task) => task.unit,
            AnnotationTask::Csv(task) => task.unit,
            AnnotationTask::Subprocess(task) => task.unit,
            AnnotationTask::Version(task) => task.unit,
        }
    }

    pub fn annotate<H: HttpFetcher, C: CommandRunner>(
        &self,
        ctx: &TaskContext<H, C>,
    ) -> Result<Value, AnnotatorError> {
        match self {
            AnnotationTask::Http(task) => task.annotate(ctx),
            AnnotationTask::Forge(task) => task.annotate(),
            AnnotationTask::None(task) => task.annotate(ctx),
            AnnotationTask::Csv(task) => task.annotate(),
            AnnotationTask::Subprocess(task) => task.annotate(ctx),
            AnnotationTask::Version(task) => task.annotate(ctx),
        }
    }

    /// Entries to persist. Version results go through
    /// [`VersionTask::extract_version`] instead and yield none here.
    pub fn extract(&self, raw: &Value) -> Vec<AnnotationEntry> {
        match self {
            AnnotationTask::Http(task) => task.extract(raw),
            AnnotationTask::Forge(task) => task.extract(raw),
            AnnotationTask::None(_) | AnnotationTask::Version(_) => Vec::new(),
            AnnotationTask::Csv(task) => task.extract(raw),
            AnnotationTask::Subprocess(task) => task.extract(raw),
        }
    }
}

impl fmt::Display for AnnotationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task for {}", self.kind(), self.unit())
    }
}

#[derive(Debug)]
pub struct HttpTask {
    unit: AnnotationUnit,
}

impl HttpTask {
    pub fn url(&self) -> Result<String, AnnotatorError> {
        let url = self.unit.dataset().url.as_deref().unwrap_or_default();
        template::render(url, self.unit.genomic_unit())
    }

    fn annotate<H: HttpFetcher, C>(&self, ctx: &TaskContext<H, C>) -> Result<Value, AnnotatorError> {
        let url = self.url()?;
        tracing::debug!(unit = %self.unit, %url, "requesting annotation");
        ctx.http.get_json(&url)
    }

    fn extract(&self, raw: &Value) -> Vec<AnnotationEntry> {
        let attribute = self.unit.dataset().attribute.as_deref().unwrap_or(".");
        extract_with_query(&self.unit, attribute, raw)
    }
}

#[derive(Debug)]
pub struct ForgeTask {
    unit: AnnotationUnit,
}

impl ForgeTask {
    fn annotate(&self) -> Result<Value, AnnotatorError> {
        let base = self.unit.dataset().base_string.as_deref().unwrap_or_default();
        let rendered = template::render(base, self.unit.genomic_unit())?;
        let mut forged = Map::new();
        forged.insert(self.unit.data_set().to_string(), Value::String(rendered));
        Ok(Value::Object(forged))
    }

    fn extract(&self, raw: &Value) -> Vec<AnnotationEntry> {
        match self.unit.dataset().attribute.as_deref() {
            Some(attribute) => extract_with_query(&self.unit, attribute, raw),
            None => entry_from_result(&self.unit, raw.clone()).into_iter().collect(),
        }
    }
}

/// Placeholder source: sleeps a random while and produces nothing.
#[derive(Debug)]
pub struct NoneTask {
    unit: AnnotationUnit,
}

impl NoneTask {
    fn annotate<H, C>(&self, ctx: &TaskContext<H, C>) -> Result<Value, AnnotatorError> {
        let max_millis = u64::try_from(ctx.none_task_max_delay.as_millis()).unwrap_or(u64::MAX);
        let millis = if max_millis == 0 {
            0
        } else {
            rand::rng().random_range(0..=max_millis)
        };
        thread::sleep(Duration::from_millis(millis));
        tracing::debug!(unit = %self.unit, millis, "placeholder task finished");
        Ok(serde_json::json!({ "none": "none" }))
    }
}

#[derive(Debug)]
pub struct CsvTask {
    unit: AnnotationUnit,
}

impl CsvTask {
    fn annotate(&self) -> Result<Value, AnnotatorError> {
        Ok(Value::String(NOT_IMPLEMENTED.to_string()))
    }

    fn extract(&self, raw: &Value) -> Vec<AnnotationEntry> {
        tracing::warn!(unit = %self.unit, result = %raw, "csv datasets are not supported yet");
        Vec::new()
    }
}

#[derive(Debug)]
pub struct SubprocessTask {
    unit: AnnotationUnit,
}

impl SubprocessTask {
    /// Program and argv. Each template token renders to exactly one argument,
    /// whatever whitespace the substituted values contain.
    pub fn command(&self) -> Result<(String, Vec<String>), AnnotatorError> {
        let template = self.unit.dataset().command.as_deref().unwrap_or_default();
        let mut parts = command_tokens(template)
            .into_iter()
            .map(|token| template::render(token, self.unit.genomic_unit()));
        let program = parts
            .next()
            .ok_or_else(|| AnnotatorError::Command("empty command".to_string()))??;
        let args = parts.collect::<Result<Vec<_>, _>>()?;
        Ok((program, args))
    }

    fn annotate<H, C: CommandRunner>(&self, ctx: &TaskContext<H, C>) -> Result<Value, AnnotatorError> {
        let (program, args) = self.command()?;
        match ctx.commands.run(&program, &args) {
            Ok(stdout) => parse_delimited(&stdout, self.unit.dataset().delimiter()),
            Err(err) => {
                tracing::error!(unit = %self.unit, %program, error = %err, "subprocess failed");
                Ok(Value::Array(Vec::new()))
            }
        }
    }

    fn extract(&self, raw: &Value) -> Vec<AnnotationEntry> {
        let attribute = self.unit.dataset().attribute.as_deref().unwrap_or(".[]");
        extract_with_query(&self.unit, attribute, raw)
    }
}

/// Whitespace-separated tokens of a command template. Whitespace inside a
/// `{placeholder}` does not split.
fn command_tokens(template: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = None;
    let mut depth = 0usize;
    for (index, ch) in template.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ch if ch.is_whitespace() && depth == 0 => {
                if let Some(begin) = start.take() {
                    tokens.push(&template[begin..index]);
                }
                continue;
            }
            _ => {}
        }
        start.get_or_insert(index);
    }
    if let Some(begin) = start {
        tokens.push(&template[begin..]);
    }
    tokens
}

/// Rows of delimited text as objects keyed by the header row.
pub fn parse_delimited(output: &str, delimiter: u8) -> Result<Value, AnnotatorError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(output.as_bytes());
    let headers = reader
        .headers()
        .map_err(|err| AnnotatorError::Delimited(err.to_string()))?
        .clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| AnnotatorError::Delimited(err.to_string()))?;
        let row: Map<String, Value> = headers
            .iter()
            .zip(record.iter())
            .map(|(column, cell)| (column.to_string(), Value::String(cell.to_string())))
            .collect();
        rows.push(Value::Object(row));
    }
    Ok(Value::Array(rows))
}

#[derive(Debug)]
pub struct VersionTask {
    unit: AnnotationUnit,
}

impl VersionTask {
    pub fn unit(&self) -> &AnnotationUnit {
        &self.unit
    }

    pub fn into_unit(self) -> AnnotationUnit {
        self.unit
    }

    fn annotate<H: HttpFetcher, C>(&self, ctx: &TaskContext<H, C>) -> Result<Value, AnnotatorError> {
        match self.unit.dataset().versioning_type {
            VersioningType::Rest => {
                let url = self.unit.dataset().version_url.as_deref().unwrap_or_default();
                tracing::debug!(unit = %self.unit, %url, "requesting version");
                ctx.http.get_json(url)
            }
            VersioningType::Rosalution => Ok(Value::String(ROSALUTION_VERSION.to_string())),
            VersioningType::Date => Ok(Value::String(Utc::now().format("%Y-%m-%d").to_string())),
        }
    }

    /// Normalizes every versioning type to one plain string.
    pub fn extract_version(&self, raw: &Value) -> Result<String, AnnotatorError> {
        let value = match self.unit.dataset().versioning_type {
            VersioningType::Rest => {
                let query = Query::parse(self.unit.dataset().version_attribute())?;
                query.evaluate(raw)?.into_iter().next().unwrap_or(Value::Null)
            }
            VersioningType::Rosalution | VersioningType::Date => raw.clone(),
        };
        let value = match value {
            Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
            other => other,
        };
        let version = match value {
            Value::Null => String::new(),
            other => value_text(&other).trim().to_string(),
        };
        if version.is_empty() {
            return Err(AnnotatorError::VersionUnavailable(format!(
                "no version for {}",
                self.unit
            )));
        }
        Ok(version)
    }
}

fn extract_with_query(unit: &AnnotationUnit, attribute: &str, raw: &Value) -> Vec<AnnotationEntry> {
    let results = match Query::parse(attribute).and_then(|query| query.evaluate(raw)) {
        Ok(results) => results,
        Err(err) => {
            tracing::error!(
                unit = %unit,
                query = attribute,
                error = %err,
                "failed to extract annotations"
            );
            return Vec::new();
        }
    };
    results
        .into_iter()
        .filter_map(|result| entry_from_result(unit, result))
        .collect()
}

fn entry_from_result(unit: &AnnotationUnit, result: Value) -> Option<AnnotationEntry> {
    let (value, transcript_id) = match result {
        Value::Null => return None,
        Value::Object(mut fields) => {
            let transcript_id = if unit.is_transcript_dataset() {
                let id = fields
                    .get("transcript_id")
                    .filter(|id| !id.is_null())
                    .map(value_text);
                if id.is_none() {
                    tracing::warn!(unit = %unit, "query result without a transcript_id");
                    return None;
                }
                id
            } else {
                None
            };
            let value = fields.remove(unit.data_set()).filter(|value| !value.is_null())?;
            (value, transcript_id)
        }
        other => {
            if unit.is_transcript_dataset() {
                tracing::warn!(unit = %unit, "transcript query result is not an object");
                return None;
            }
            (other, None)
        }
    };
    Some(AnnotationEntry {
        data_set: unit.data_set().to_string(),
        data_source: unit.dataset().data_source.clone(),
        version: unit.version().to_string(),
        value,
        transcript_id,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_delimited_rows_by_header() {
        let output = "gene\tscore\nVMA21\t0.97\n\nLMNA\t0.12\n";
        assert_eq!(
            parse_delimited(output, b'\t').unwrap(),
            json!([
                {"gene": "VMA21", "score": "0.97"},
                {"gene": "LMNA", "score": "0.12"}
            ])
        );
        assert_eq!(parse_delimited("", b',').unwrap(), json!([]));
    }

    #[test]
    fn quoted_fields_keep_embedded_delimiters() {
        let output = "gene,summary\nVMA21,\"assembly, factor\"\n";
        assert_eq!(
            parse_delimited(output, b',').unwrap(),
            json!([{"gene": "VMA21", "summary": "assembly, factor"}])
        );
    }

    #[test]
    fn command_tokens_keep_placeholders_whole() {
        assert_eq!(
            command_tokens("  score-gene --name {Gene Name}\t{gene} "),
            vec!["score-gene", "--name", "{Gene Name}", "{gene}"]
        );
        assert!(command_tokens("   ").is_empty());
    }
}
