use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobConfiguration, UsageRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
}

/// Accumulated processing totals; must equal the sum of the job's per-stage
/// usage records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_tokens: TokenTotals,
    pub total_cost_usd: f64,
    pub total_time_seconds: f64,
    pub request_count: u64,
    pub stages_completed: Vec<String>,
}

impl ProcessingStats {
    pub fn record(&mut self, usage: &UsageRecord) {
        self.total_tokens.input += usage.input_tokens;
        self.total_tokens.output += usage.output_tokens;
        self.total_cost_usd += usage.cost_usd;
        self.total_time_seconds += usage.duration_seconds;
        self.request_count += usage.request_count;
    }

    pub fn mark_stage_completed(&mut self, stage: super::StageName) {
        let name = stage.to_string();
        if !self.stages_completed.contains(&name) {
            self.stages_completed.push(name);
        }
    }
}

/// Media facts gathered during INGEST, enriched with the language detected
/// during SCRIBE or REFINE.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Job metadata, serialized as `meta.json`: the frozen configuration
/// snapshot plus processing totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    pub job_id: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub configuration: JobConfiguration,
    #[serde(default)]
    pub media: MediaSummary,
    #[serde(default)]
    pub processing: ProcessingStats,
}

impl JobMeta {
    pub fn new(
        job_id: String,
        source: String,
        created_at: DateTime<Utc>,
        configuration: JobConfiguration,
    ) -> Self {
        JobMeta {
            job_id,
            source,
            created_at,
            updated_at: created_at,
            configuration,
            media: MediaSummary::default(),
            processing: ProcessingStats::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StageName;

    #[test]
    fn processing_totals_are_the_sum_of_usage_records() {
        let mut stats = ProcessingStats::default();

        let mut scribe = UsageRecord::new(StageName::Scribe, "aurel", "aurel-swift");
        scribe.add_tokens(1_000, 4_000);
        scribe.cost_usd = 0.0123;
        scribe.request_count = 2;
        scribe.duration_seconds = 14.0;

        let mut refine = UsageRecord::new(StageName::Refine, "aurel", "aurel-swift");
        refine.add_tokens(2_000, 500);
        refine.cost_usd = 0.0041;
        refine.request_count = 1;
        refine.duration_seconds = 6.5;

        stats.record(&scribe);
        stats.record(&refine);

        assert_eq!(stats.total_tokens.input, 3_000);
        assert_eq!(stats.total_tokens.output, 4_500);
        assert_eq!(stats.request_count, 3);
        assert!((stats.total_cost_usd - 0.0164).abs() < 1e-9);
        assert!((stats.total_time_seconds - 20.5).abs() < 1e-9);
    }

    #[test]
    fn stage_completion_is_recorded_once() {
        let mut stats = ProcessingStats::default();
        stats.mark_stage_completed(StageName::Ingest);
        stats.mark_stage_completed(StageName::Ingest);
        assert_eq!(stats.stages_completed, vec!["ingest"]);
    }
}
