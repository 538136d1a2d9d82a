use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{StageName, StageStatus};

/// Overall job lifecycle, derived from the per-stage statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobStatus::Created),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageState {
    pub fn pending() -> Self {
        StageState {
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Persistent per-job stage ledger, serialized as `state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub status: JobStatus,
    pub stages: BTreeMap<StageName, StageState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobState {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        let stages = StageName::ALL
            .into_iter()
            .map(|s| (s, StageState::pending()))
            .collect();
        JobState {
            status: JobStatus::Created,
            stages,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn stage(&self, name: StageName) -> &StageState {
        self.stages.get(&name).expect("all stages are initialized")
    }

    /// Whether `stage` may transition to `Running`: every earlier stage must
    /// be completed or skipped.
    pub fn can_start(&self, stage: StageName) -> bool {
        StageName::ALL
            .into_iter()
            .take_while(|s| *s < stage)
            .all(|s| self.stage(s).status.is_settled())
    }

    pub fn mark_running(&mut self, stage: StageName, now: DateTime<Utc>) {
        let entry = self.stages.get_mut(&stage).expect("stage exists");
        entry.status = StageStatus::Running;
        entry.started_at = Some(now);
        entry.finished_at = None;
        entry.error = None;
        self.status = JobStatus::Running;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, stage: StageName, now: DateTime<Utc>) {
        let entry = self.stages.get_mut(&stage).expect("stage exists");
        entry.status = StageStatus::Completed;
        entry.finished_at = Some(now);
        self.updated_at = now;
        self.recompute_status();
    }

    pub fn mark_failed(&mut self, stage: StageName, error: String, now: DateTime<Utc>) {
        let entry = self.stages.get_mut(&stage).expect("stage exists");
        entry.status = StageStatus::Failed;
        entry.finished_at = Some(now);
        entry.error = Some(error);
        self.status = JobStatus::Failed;
        self.updated_at = now;
    }

    pub fn mark_skipped(&mut self, stage: StageName, now: DateTime<Utc>) {
        let entry = self.stages.get_mut(&stage).expect("stage exists");
        entry.status = StageStatus::Skipped;
        entry.finished_at = Some(now);
        self.updated_at = now;
        self.recompute_status();
    }

    /// Reset `from` and every later stage to `Pending`. Returns the stages
    /// that were reset so the caller can clear their artifacts.
    pub fn reset_from(&mut self, from: StageName, now: DateTime<Utc>) -> Vec<StageName> {
        let reset: Vec<StageName> = from.onwards().collect();
        for stage in &reset {
            self.stages.insert(*stage, StageState::pending());
        }
        self.updated_at = now;
        self.recompute_status();
        reset
    }

    /// The first stage that is not completed or skipped, if any.
    pub fn first_unsettled(&self) -> Option<StageName> {
        StageName::ALL
            .into_iter()
            .find(|s| !self.stage(*s).status.is_settled())
    }

    pub fn failed_stage(&self) -> Option<StageName> {
        StageName::ALL
            .into_iter()
            .find(|s| self.stage(*s).status == StageStatus::Failed)
    }

    pub fn running_stage(&self) -> Option<StageName> {
        StageName::ALL
            .into_iter()
            .find(|s| self.stage(*s).status == StageStatus::Running)
    }

    fn recompute_status(&mut self) {
        if self.failed_stage().is_some() {
            self.status = JobStatus::Failed;
        } else if self.first_unsettled().is_none() {
            self.status = JobStatus::Completed;
        } else if self
            .stages
            .values()
            .any(|s| s.status != StageStatus::Pending)
        {
            self.status = JobStatus::Running;
        } else {
            self.status = JobStatus::Created;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn fresh_state_is_created_with_all_pending() {
        let state = JobState::new(now());
        assert_eq!(state.status, JobStatus::Created);
        for stage in StageName::ALL {
            assert_eq!(state.stage(stage).status, StageStatus::Pending);
        }
    }

    #[test]
    fn stage_cannot_start_before_predecessors_settle() {
        let mut state = JobState::new(now());
        assert!(state.can_start(StageName::Ingest));
        assert!(!state.can_start(StageName::Scribe));

        state.mark_running(StageName::Ingest, now());
        state.mark_completed(StageName::Ingest, now());
        assert!(state.can_start(StageName::Scribe));
        assert!(!state.can_start(StageName::Refine));
    }

    #[test]
    fn skipped_stage_satisfies_downstream_prerequisites() {
        let mut state = JobState::new(now());
        state.mark_completed(StageName::Ingest, now());
        state.mark_skipped(StageName::Scribe, now());
        assert!(state.can_start(StageName::Refine));
    }

    #[test]
    fn reset_cascades_to_later_stages() {
        let mut state = JobState::new(now());
        for stage in StageName::ALL {
            state.mark_completed(stage, now());
        }
        assert_eq!(state.status, JobStatus::Completed);

        let reset = state.reset_from(StageName::Refine, now());
        assert_eq!(
            reset,
            vec![StageName::Refine, StageName::Generate, StageName::Shelve]
        );
        assert_eq!(state.stage(StageName::Scribe).status, StageStatus::Completed);
        for stage in [StageName::Refine, StageName::Generate, StageName::Shelve] {
            assert_eq!(state.stage(stage).status, StageStatus::Pending);
        }
        assert_eq!(state.status, JobStatus::Running);
    }

    #[test]
    fn failure_marks_the_job_failed_and_records_the_cause() {
        let mut state = JobState::new(now());
        state.mark_running(StageName::Ingest, now());
        state.mark_failed(StageName::Ingest, "source file is empty".into(), now());
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.failed_stage(), Some(StageName::Ingest));
        assert_eq!(
            state.stage(StageName::Ingest).error.as_deref(),
            Some("source file is empty")
        );
    }

    #[test]
    fn state_serialization_round_trips_byte_identically() {
        let mut state = JobState::new(now());
        state.mark_completed(StageName::Ingest, now());
        let first = serde_json::to_vec_pretty(&state).unwrap();
        let reloaded: JobState = serde_json::from_slice(&first).unwrap();
        let second = serde_json::to_vec_pretty(&reloaded).unwrap();
        assert_eq!(first, second);
    }
}
