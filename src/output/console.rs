use super::{ExportSink, JobRecord};
use crate::error::{Error, Result};
use crate::model::Job;
use async_trait::async_trait;
use indicatif::MultiProgress;
use std::sync::Arc;

pub struct ConsoleSink {
    multi: Option<Arc<MultiProgress>>,
}

impl ConsoleSink {
    pub fn new(multi: Option<Arc<MultiProgress>>) -> Self {
        Self { multi }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new(None)
    }
}

/// One header line, then the optional fields that are set.
fn render(record: &JobRecord) -> Vec<String> {
    let mut lines = vec![format!(
        "{} [{}] {} priority={} retries={}",
        record.id, record.status, record.provider, record.priority, record.retry_count
    )];
    lines.push(format!("  prompt: {}", record.prompt));
    lines.push(format!("  created: {}", record.created_at));
    if let Some(completed_at) = &record.completed_at {
        lines.push(format!("  completed: {}", completed_at));
    }
    if let Some(secs) = record.processing_time_secs {
        lines.push(format!("  took: {:.1}s", secs));
    }
    if !record.images.is_empty() {
        lines.push(format!("  images: {}", record.images));
    }
    if let Some(error) = &record.error {
        lines.push(format!("  error: {}", error));
    }
    if let Some(batch_id) = &record.batch_id {
        lines.push(format!("  batch: {}", batch_id));
    }
    lines
}

#[async_trait]
impl ExportSink for ConsoleSink {
    async fn write(&mut self, job: &Job) -> Result<()> {
        let lines = render(&JobRecord::from(job));

        if let Some(multi) = &self.multi {
            for line in &lines {
                multi.println(line).map_err(|e| Error::Internal(e.to_string()))?;
            }
        } else {
            for line in &lines {
                println!("{}", line);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn renders_flat_fields_and_skips_unset_ones() {
        let mut job = Job::new("a red kite", "ImageFX", 4, Utc::now());
        job.start().unwrap();
        job.fail("upstream 502", Utc::now()).unwrap();

        let lines = render(&JobRecord::from(&job));
        assert_eq!(
            lines[0],
            format!("{} [failed] ImageFX priority=4 retries=0", job.id)
        );
        assert!(lines.contains(&"  prompt: a red kite".to_string()));
        assert!(lines.contains(&"  error: upstream 502".to_string()));
        assert!(!lines.iter().any(|l| l.starts_with("  images:")));
        assert!(!lines.iter().any(|l| l.starts_with("  batch:")));
        assert!(!lines.iter().any(|l| l.contains('{')));
    }
}
