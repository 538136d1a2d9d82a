use serde::{Deserialize, Serialize};

use super::StageName;

/// Billing and effort data for one provider interaction within a stage.
/// A job's totals are the sum of its records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub stage: StageName,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_seconds: f64,
    pub request_count: u64,
}

impl UsageRecord {
    pub fn new(stage: StageName, provider: &str, model: &str) -> Self {
        UsageRecord {
            stage,
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            duration_seconds: 0.0,
            request_count: 0,
        }
    }

    pub fn add_tokens(&mut self, input: u64, output: u64) {
        self.input_tokens += input;
        self.output_tokens += output;
    }
}
