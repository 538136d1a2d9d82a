use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::{JobMeta, JobState};

/// Chronologically sortable job identifier: `YY-MMDD-HHMMSS_<slug>`.
///
/// The slug is the sanitized stem of the source file; lexicographic order of
/// ids equals creation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn generate(created_at: DateTime<Utc>, source_stem: &str) -> Self {
        let slug = sanitize_slug(source_stem);
        JobId(format!("{}_{}", created_at.format("%y-%m%d-%H%M%S"), slug))
    }

    pub fn from_string(id: String) -> Self {
        JobId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The slug portion of the id (everything after the timestamp).
    pub fn slug(&self) -> &str {
        self.0.split_once('_').map(|(_, s)| s).unwrap_or(&self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn sanitize_slug(stem: &str) -> String {
    let slug: String = stem
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if slug.is_empty() {
        "media".to_string()
    } else {
        slug
    }
}

/// A unit of work: persistent state and metadata plus an owned working
/// directory. Everything a job writes lives under `dir` until finalization.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub dir: PathBuf,
    pub state: JobState,
    pub meta: JobMeta,
}

impl Job {
    pub fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    pub fn media_dir(&self) -> PathBuf {
        self.dir.join("media")
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.dir.join("transcripts")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.dir.join("artifacts")
    }

    pub fn stages_dir(&self) -> PathBuf {
        self.dir.join("_stages")
    }

    pub fn stage_record_path(&self, stage: super::StageName) -> PathBuf {
        self.stages_dir().join(format!("{}.json", stage))
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.stages_dir().join("trash")
    }

    pub fn ingest_result_path(&self) -> PathBuf {
        self.stage_record_path(super::StageName::Ingest)
    }

    pub fn raw_transcript_path(&self) -> PathBuf {
        self.transcripts_dir().join("raw_transcript.json")
    }

    pub fn partial_transcript_path(&self) -> PathBuf {
        self.transcripts_dir().join("raw_transcript.partial.ndjson")
    }

    pub fn enriched_context_path(&self) -> PathBuf {
        self.transcripts_dir().join("enriched_context.json")
    }

    /// The copy of the source media made at job creation, if still present.
    pub fn working_copy(&self) -> Option<PathBuf> {
        let media = self.media_dir();
        let entries = std::fs::read_dir(&media).ok()?;
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| {
                p.file_stem()
                    .map(|s| s == Path::new("original").as_os_str())
                    .unwrap_or(false)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn job_ids_sort_chronologically() {
        let earlier = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 11, 20, 18, 5, 59).unwrap();
        let a = JobId::generate(earlier, "meeting");
        let b = JobId::generate(later, "meeting");
        assert!(a < b);
    }

    #[test]
    fn slug_is_sanitized() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let id = JobId::generate(now, "team sync (v2)!");
        assert_eq!(id.slug(), "team_sync__v2__");
    }

    #[test]
    fn empty_stem_falls_back_to_media() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let id = JobId::generate(now, "");
        assert_eq!(id.slug(), "media");
    }
}
