pub mod batch;
pub mod failure;
pub mod job;
pub mod provider;

pub use batch::{Batch, BatchOutcome, BatchProgress};
pub use failure::{ErrorKind, FailureClass, FailureDetails, FailureRecord, ManualEntry, ManualStatus};
pub use job::{Job, JobResult, JobStatus, MAX_PRIORITY, MIN_PRIORITY, clamp_priority};
pub use provider::{ProviderProfile, SelectorAudit, SelectorMap};
