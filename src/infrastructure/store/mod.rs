mod atomic;
mod fs_job_store;

pub use atomic::{read_json_with_retry, write_json_atomic};
pub use fs_job_store::FsJobStore;
