use super::{ExportSink, JobRecord};
use crate::error::{Error, Result};
use crate::model::Job;
use async_trait::async_trait;
use std::io::Write;

pub struct CsvSink<W: Write + Send> {
    writer: csv::Writer<W>,
}

impl<W: Write + Send> CsvSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(out),
        }
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| Error::Internal(e.to_string()))
    }
}

#[async_trait]
impl<W: Write + Send> ExportSink for CsvSink<W> {
    async fn write(&mut self, job: &Job) -> Result<()> {
        self.writer
            .serialize(JobRecord::from(job))
            .map_err(|e| Error::Internal(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
