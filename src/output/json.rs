use super::{ExportSink, JobRecord};
use crate::error::Result;
use crate::model::Job;
use async_trait::async_trait;
use std::io::Write;

/// Writes a single JSON array, one element per job.
pub struct JsonSink<W: Write + Send> {
    out: W,
    first: bool,
}

impl<W: Write + Send> JsonSink<W> {
    pub fn new(mut out: W) -> Result<Self> {
        write!(out, "[")?;
        Ok(Self { out, first: true })
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W: Write + Send> ExportSink for JsonSink<W> {
    async fn write(&mut self, job: &Job) -> Result<()> {
        if !self.first {
            write!(self.out, ",")?;
        } else {
            self.first = false;
        }

        serde_json::to_writer(&mut self.out, &JobRecord::from(job))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        writeln!(self.out, "]")?;
        self.out.flush()?;
        Ok(())
    }
}
