pub mod manager;
pub mod pipeline;
pub mod ports;
pub mod reporting;

pub use manager::{JobManager, ManagerError};
pub use pipeline::{
    GenerateStage, IngestStage, PipelineDriver, PrereqError, RefineStage, ScribeStage,
    ShelveStage, StageError, StageExecutor, StageFailureCause, StageRecord,
};
pub use reporting::{ReportSummary, UsageReporter};
