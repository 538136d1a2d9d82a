use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The five pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Ingest,
    Scribe,
    Refine,
    Generate,
    Shelve,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        StageName::Ingest,
        StageName::Scribe,
        StageName::Refine,
        StageName::Generate,
        StageName::Shelve,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Ingest => "ingest",
            StageName::Scribe => "scribe",
            StageName::Refine => "refine",
            StageName::Generate => "generate",
            StageName::Shelve => "shelve",
        }
    }

    /// Stages from `self` through `stop_after`, inclusive.
    pub fn span(self, stop_after: StageName) -> impl Iterator<Item = StageName> {
        StageName::ALL
            .into_iter()
            .filter(move |s| *s >= self && *s <= stop_after)
    }

    /// Stages from `self` to the end of the pipeline, inclusive.
    pub fn onwards(self) -> impl Iterator<Item = StageName> {
        self.span(StageName::Shelve)
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(StageName::Ingest),
            "scribe" => Ok(StageName::Scribe),
            "refine" => Ok(StageName::Refine),
            "generate" => Ok(StageName::Generate),
            "shelve" => Ok(StageName::Shelve),
            other => Err(format!("unknown stage: {}", other)),
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-stage execution status.
///
/// A stage may enter `Running` only when every earlier stage is `Completed`
/// or `Skipped`; resetting a stage to `Pending` resets every later stage too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    /// Completed and skipped stages both satisfy downstream prerequisites.
    pub fn is_settled(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Skipped)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "running" => Ok(StageStatus::Running),
            "completed" => Ok(StageStatus::Completed),
            "failed" => Ok(StageStatus::Failed),
            "skipped" => Ok(StageStatus::Skipped),
            other => Err(format!("unknown stage status: {}", other)),
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_matches_pipeline_order() {
        assert!(StageName::Ingest < StageName::Scribe);
        assert!(StageName::Scribe < StageName::Refine);
        assert!(StageName::Refine < StageName::Generate);
        assert!(StageName::Generate < StageName::Shelve);
    }

    #[test]
    fn span_is_inclusive_on_both_ends() {
        let stages: Vec<_> = StageName::Scribe.span(StageName::Generate).collect();
        assert_eq!(
            stages,
            vec![StageName::Scribe, StageName::Refine, StageName::Generate]
        );
    }

    #[test]
    fn onwards_reaches_shelve() {
        let stages: Vec<_> = StageName::Generate.onwards().collect();
        assert_eq!(stages, vec![StageName::Generate, StageName::Shelve]);
    }

    #[test]
    fn stage_name_round_trips_through_str() {
        for stage in StageName::ALL {
            assert_eq!(stage.as_str().parse::<StageName>().unwrap(), stage);
        }
    }

    #[test]
    fn settled_covers_completed_and_skipped() {
        assert!(StageStatus::Completed.is_settled());
        assert!(StageStatus::Skipped.is_settled());
        assert!(!StageStatus::Failed.is_settled());
        assert!(!StageStatus::Pending.is_settled());
        assert!(!StageStatus::Running.is_settled());
    }
}
