use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ElementNotFound,
    RateLimit,
    ServerError,
    Timeout,
    Maintenance,
    QuotaExceeded,
    Configuration,
    #[serde(other)]
    Unknown,
}

/// How the worker routes a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Selector/automation breakage, handled by the recovery chain.
    Automation,
    /// Worth another attempt.
    Transient,
    /// The provider refuses work for a while; the job is deferred, not failed.
    Lockout,
    /// Retrying cannot help.
    Configuration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ElementNotFound => "element_not_found",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Maintenance => "maintenance",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Unknown => "unknown",
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            ErrorKind::ElementNotFound => FailureClass::Automation,
            ErrorKind::RateLimit | ErrorKind::QuotaExceeded | ErrorKind::Maintenance => {
                FailureClass::Lockout
            }
            ErrorKind::Configuration => FailureClass::Configuration,
            ErrorKind::ServerError | ErrorKind::Timeout | ErrorKind::Unknown => {
                FailureClass::Transient
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureDetails {
    #[serde(default)]
    pub missing_element: Option<String>,
    /// Captured HTML of the page at the time of failure, or a reference to it.
    #[serde(default)]
    pub page_snapshot: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl FailureDetails {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn missing(element: impl Into<String>) -> Self {
        Self {
            missing_element: Some(element.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub job_id: String,
    pub provider: String,
    pub error_kind: ErrorKind,
    pub details: FailureDetails,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualStatus {
    PendingManual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualEntry {
    pub job_id: String,
    pub provider: String,
    pub error_kind: ErrorKind,
    pub details: FailureDetails,
    pub queued_at: DateTime<Utc>,
    pub status: ManualStatus,
}
