pub mod app;
pub mod cli;
pub mod settings;

pub use app::{App, AppError};
pub use cli::{Cli, Commands, JobsCommand};
pub use settings::Settings;
