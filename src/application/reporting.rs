use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::application::ports::{JobFilter, JobStore, StoreError};

/// Fleet-wide usage summary over the working root.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReportSummary {
    pub period_days: i64,
    pub total_jobs: usize,
    pub total_cost_usd: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_time_seconds: f64,
    pub request_count: u64,
    pub jobs_by_status: BTreeMap<String, usize>,
    pub jobs_by_model: BTreeMap<String, usize>,
}

pub struct UsageReporter {
    store: Arc<dyn JobStore>,
}

impl UsageReporter {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        UsageReporter { store }
    }

    /// Aggregate `meta.json` processing totals across jobs created in the
    /// last `days` days.
    pub async fn summarize(&self, days: i64) -> Result<ReportSummary, StoreError> {
        let filter = JobFilter {
            status: None,
            since: Some(Utc::now() - Duration::days(days)),
        };
        let jobs = self.store.list(&filter).await?;

        let mut summary = ReportSummary {
            period_days: days,
            ..ReportSummary::default()
        };

        for job in jobs {
            let stats = &job.meta.processing;
            summary.total_jobs += 1;
            summary.total_cost_usd += stats.total_cost_usd;
            summary.total_input_tokens += stats.total_tokens.input;
            summary.total_output_tokens += stats.total_tokens.output;
            summary.total_time_seconds += stats.total_time_seconds;
            summary.request_count += stats.request_count;

            *summary
                .jobs_by_status
                .entry(job.state.status.to_string())
                .or_default() += 1;
            *summary
                .jobs_by_model
                .entry(job.meta.configuration.transcribe.model.clone())
                .or_default() += 1;
        }

        Ok(summary)
    }
}

impl fmt::Display for ReportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = "=".repeat(50);
        writeln!(f, "{}", line)?;
        writeln!(f, "Cost & usage report (last {} days)", self.period_days)?;
        writeln!(f, "{}", line)?;
        writeln!(f, "Total jobs:     {}", self.total_jobs)?;
        writeln!(f, "Total cost:     ${:.4}", self.total_cost_usd)?;
        writeln!(
            f,
            "Total tokens:   {}",
            self.total_input_tokens + self.total_output_tokens
        )?;
        writeln!(f, "  - input:      {}", self.total_input_tokens)?;
        writeln!(f, "  - output:     {}", self.total_output_tokens)?;
        writeln!(f, "Requests:       {}", self.request_count)?;
        let avg = if self.total_jobs > 0 {
            self.total_cost_usd / self.total_jobs as f64
        } else {
            0.0
        };
        writeln!(f, "Avg cost/job:   ${:.4}", avg)?;

        writeln!(f, "\nJobs by status:")?;
        for (status, count) in &self.jobs_by_status {
            writeln!(f, "  - {:<12} {}", status, count)?;
        }
        writeln!(f, "\nJobs by model:")?;
        for (model, count) in &self.jobs_by_model {
            writeln!(f, "  - {:<24} {}", model, count)?;
        }
        writeln!(f, "{}", line)
    }
}
