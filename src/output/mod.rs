use crate::error::Result;
use crate::model::Job;
use async_trait::async_trait;
use indicatif::MultiProgress;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

pub mod console;
pub mod csv;
pub mod json;

pub use self::console::ConsoleSink;
pub use self::csv::CsvSink;
pub use self::json::JsonSink;

/// Destination for exported job records.
#[async_trait]
pub trait ExportSink: Send {
    async fn write(&mut self, job: &Job) -> Result<()>;
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Console,
    Json,
    Csv,
}

/// A job flattened to one row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub provider: String,
    pub status: String,
    pub priority: u8,
    pub retry_count: u32,
    pub prompt: String,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub processing_time_secs: Option<f64>,
    pub images: String,
    pub error: Option<String>,
    pub batch_id: Option<String>,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            provider: job.provider.clone(),
            status: job.status.to_string(),
            priority: job.priority,
            retry_count: job.retry_count,
            prompt: job.prompt.clone(),
            created_at: job.created_at.to_rfc3339(),
            completed_at: job.completed_at.map(|t| t.to_rfc3339()),
            processing_time_secs: job.result.as_ref().map(|r| r.processing_time_secs),
            images: job
                .result
                .as_ref()
                .map(|r| r.images.join(" "))
                .unwrap_or_default(),
            error: job.error.clone(),
            batch_id: job.batch_id().map(str::to_string),
        }
    }
}

fn open_target(path: Option<&Path>) -> Result<Box<dyn Write + Send>> {
    Ok(match path {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(std::io::stdout()),
    })
}

/// Builds the sink for `format`. File formats write to stdout without a path.
pub fn create_sink(
    format: ExportFormat,
    path: Option<&Path>,
    multi: Option<Arc<MultiProgress>>,
) -> Result<Box<dyn ExportSink>> {
    Ok(match format {
        ExportFormat::Console => Box::new(ConsoleSink::new(multi)),
        ExportFormat::Json => Box::new(JsonSink::new(open_target(path)?)?),
        ExportFormat::Csv => Box::new(CsvSink::new(open_target(path)?)),
    })
}
