use crate::error::Result;
use crate::model::{Job, JobStatus};
use crate::store::{JobQuery, Store};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ReportRange {
    #[value(name = "1h")]
    Hour,
    #[default]
    #[value(name = "24h")]
    Day,
    #[value(name = "7d")]
    Week,
    #[value(name = "30d")]
    Month,
}

impl ReportRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportRange::Hour => "1h",
            ReportRange::Day => "24h",
            ReportRange::Week => "7d",
            ReportRange::Month => "30d",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            ReportRange::Hour => Duration::hours(1),
            ReportRange::Day => Duration::hours(24),
            ReportRange::Week => Duration::days(7),
            ReportRange::Month => Duration::days(30),
        }
    }
}

impl fmt::Display for ReportRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatistics {
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub status_breakdown: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderPerformance {
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub success_rate: f64,
    pub avg_processing_time_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorType {
    pub error_message: String,
    pub count: u64,
    pub affected_providers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorAnalysis {
    pub total_errors: u64,
    pub error_types: Vec<ErrorType>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub time_range: String,
    pub generated_at: DateTime<Utc>,
    pub job_statistics: JobStatistics,
    pub provider_performance: BTreeMap<String, ProviderPerformance>,
    pub error_analysis: ErrorAnalysis,
    pub recommendations: Vec<String>,
}

const TOP_ERRORS: usize = 10;

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

/// Report over every job created in the trailing `range`.
pub async fn performance_report(
    store: &dyn Store,
    range: ReportRange,
    now: DateTime<Utc>,
) -> Result<PerformanceReport> {
    let jobs = store
        .list_jobs(&JobQuery::new().created_since(now - range.duration()))
        .await?;
    Ok(build_report(&jobs, range, now))
}

/// Builds a report over `jobs`, which should already be limited to the range.
pub fn build_report(jobs: &[Job], range: ReportRange, now: DateTime<Utc>) -> PerformanceReport {
    let job_statistics = job_statistics(jobs);
    let provider_performance = provider_performance(jobs);
    let error_analysis = error_analysis(jobs);
    let recommendations = recommendations(&job_statistics, &provider_performance, &error_analysis);

    PerformanceReport {
        time_range: range.to_string(),
        generated_at: now,
        job_statistics,
        provider_performance,
        error_analysis,
        recommendations,
    }
}

fn job_statistics(jobs: &[Job]) -> JobStatistics {
    let mut status_breakdown = BTreeMap::new();
    for job in jobs {
        *status_breakdown
            .entry(job.status.as_str().to_string())
            .or_insert(0) += 1;
    }
    let total = jobs.len() as u64;
    let completed = status_breakdown.get(JobStatus::Completed.as_str()).copied().unwrap_or(0);
    let failed = status_breakdown.get(JobStatus::Failed.as_str()).copied().unwrap_or(0);

    JobStatistics {
        total_jobs: total,
        completed_jobs: completed,
        failed_jobs: failed,
        success_rate: percent(completed, total),
        failure_rate: percent(failed, total),
        status_breakdown,
    }
}

fn provider_performance(jobs: &[Job]) -> BTreeMap<String, ProviderPerformance> {
    #[derive(Default)]
    struct Tally {
        total: u64,
        completed: u64,
        failed: u64,
        processing_secs: Vec<f64>,
    }

    let mut tallies: BTreeMap<&str, Tally> = BTreeMap::new();
    for job in jobs {
        let tally = tallies.entry(job.provider.as_str()).or_default();
        tally.total += 1;
        match job.status {
            JobStatus::Completed => {
                tally.completed += 1;
                if let Some(secs) = job.processing_time_secs() {
                    tally.processing_secs.push(secs);
                }
            }
            JobStatus::Failed => tally.failed += 1,
            _ => {}
        }
    }

    tallies
        .into_iter()
        .map(|(provider, tally)| {
            let avg = if tally.processing_secs.is_empty() {
                0.0
            } else {
                tally.processing_secs.iter().sum::<f64>() / tally.processing_secs.len() as f64
            };
            (
                provider.to_string(),
                ProviderPerformance {
                    total_jobs: tally.total,
                    completed_jobs: tally.completed,
                    failed_jobs: tally.failed,
                    success_rate: percent(tally.completed, tally.total),
                    avg_processing_time_seconds: avg,
                },
            )
        })
        .collect()
}

fn error_analysis(jobs: &[Job]) -> ErrorAnalysis {
    let mut grouped: HashMap<&str, (u64, BTreeSet<&str>)> = HashMap::new();
    for job in jobs.iter().filter(|j| j.status == JobStatus::Failed) {
        if let Some(error) = job.error.as_deref() {
            let entry = grouped.entry(error).or_default();
            entry.0 += 1;
            entry.1.insert(job.provider.as_str());
        }
    }

    let total_errors: u64 = grouped.values().map(|(count, _)| count).sum();
    let mut error_types: Vec<ErrorType> = grouped
        .into_iter()
        .map(|(message, (count, providers))| ErrorType {
            error_message: message.to_string(),
            count,
            affected_providers: providers.into_iter().map(str::to_string).collect(),
        })
        .collect();
    error_types.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.error_message.cmp(&b.error_message))
    });
    error_types.truncate(TOP_ERRORS);

    ErrorAnalysis {
        total_errors,
        error_types,
    }
}

fn recommendations(
    stats: &JobStatistics,
    providers: &BTreeMap<String, ProviderPerformance>,
    errors: &ErrorAnalysis,
) -> Vec<String> {
    let mut out = Vec::new();

    if stats.success_rate < 80.0 {
        out.push(
            "Overall success rate is below 80%. Consider reviewing error patterns and updating automation scripts."
                .to_string(),
        );
    }

    for (provider, perf) in providers {
        if perf.success_rate < 70.0 {
            out.push(format!(
                "{} has low success rate ({:.1}%). Review selectors and automation logic.",
                provider, perf.success_rate
            ));
        }
        if perf.avg_processing_time_seconds > 120.0 {
            out.push(format!(
                "{} has high processing time ({:.1}s). Consider optimizing timeouts.",
                provider, perf.avg_processing_time_seconds
            ));
        }
    }

    if errors.total_errors as f64 > stats.total_jobs.max(1) as f64 * 0.2 {
        out.push(
            "High error rate detected. Review common error patterns and implement fixes.".to_string(),
        );
    }

    if out.is_empty() {
        out.push("System is performing well! No immediate optimizations needed.".to_string());
    }
    out
}
