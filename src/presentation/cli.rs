//! Command-line interface, parsed with clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::domain::{CompressionMode, ShelveStrategy, StageName};

/// Audio-to-document processing engine
#[derive(Parser, Debug)]
#[command(name = "scrivano", version, about = "Audio-to-document processing engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress output (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a job from a media file and execute the pipeline
    Run {
        /// Media file to process
        source: PathBuf,

        /// Stop after this stage instead of running through shelve
        #[arg(long, value_name = "STAGE")]
        stop_after: Option<StageName>,

        /// Direct mode: skip transcription, refine against the audio
        #[arg(long)]
        skip_transcript: bool,

        /// Media preparation mode (original, compressed, optimized)
        #[arg(long, value_name = "MODE")]
        compression_mode: Option<CompressionMode>,

        /// Override the transcription model
        #[arg(long, value_name = "MODEL")]
        model: Option<String>,

        /// Shelving strategy (timeline, flat, zettelkasten)
        #[arg(long, value_name = "STRATEGY")]
        shelve_mode: Option<ShelveStrategy>,
    },

    /// Create a job and run it starting at ingest
    Ingest {
        /// Media file to process
        source: PathBuf,

        /// Stop after this stage
        #[arg(long, value_name = "STAGE")]
        stop_after: Option<StageName>,
    },

    /// Continue the given (or latest) job from the scribe stage
    Scribe {
        /// Job id (defaults to the most recently updated job)
        id: Option<String>,

        /// Stop after this stage
        #[arg(long, value_name = "STAGE")]
        stop_after: Option<StageName>,
    },

    /// Continue the given (or latest) job from the refine stage
    Refine {
        /// Job id (defaults to the most recently updated job)
        id: Option<String>,

        /// Stop after this stage
        #[arg(long, value_name = "STAGE")]
        stop_after: Option<StageName>,
    },

    /// Continue the given (or latest) job from the generate stage
    Generate {
        /// Job id (defaults to the most recently updated job)
        id: Option<String>,

        /// Stop after this stage
        #[arg(long, value_name = "STAGE")]
        stop_after: Option<StageName>,
    },

    /// Continue the given (or latest) job from the shelve stage
    Shelve {
        /// Job id (defaults to the most recently updated job)
        id: Option<String>,

        /// Stop after this stage
        #[arg(long, value_name = "STAGE")]
        stop_after: Option<StageName>,
    },

    /// Inspect and manage jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },

    /// Watch the input directory and process files as they appear
    Watch,

    /// Aggregate usage and cost across jobs in the working root
    Report {
        /// Look-back window in days
        #[arg(long, default_value = "30")]
        days: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum JobsCommand {
    /// Enumerate jobs
    List {
        /// Filter by status (created, running, completed, failed)
        #[arg(long)]
        status: Option<String>,

        /// Only jobs created in the last N days
        #[arg(long, value_name = "DAYS")]
        since: Option<i64>,
    },

    /// Print a job's state and usage
    Show {
        /// Job id
        id: String,
    },

    /// Reset a job and re-run it
    Retry {
        /// Job id
        id: String,

        /// Stage to restart from (defaults to the first non-completed stage)
        #[arg(long, value_name = "STAGE")]
        from_stage: Option<StageName>,
    },

    /// Delete old terminal jobs per the retention policy
    Cleanup {
        /// Delete matching jobs older than this many days
        #[arg(long, value_name = "DAYS")]
        older_than: Option<i64>,

        /// Only jobs with this status (completed, failed)
        #[arg(long)]
        status: Option<String>,
    },

    /// Remove a job's working directory
    Delete {
        /// Job id
        id: String,
    },

    /// Copy artifacts to the results library and prune the working directory
    Finalize {
        /// Job id
        id: String,
    },
}
