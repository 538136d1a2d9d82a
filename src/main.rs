use clap::Parser;

use scrivano::infrastructure::observability::{init_tracing, TracingConfig};
use scrivano::presentation::app::log_fatal;
use scrivano::presentation::{App, AppError, Cli, Settings};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let level = if cli.quiet {
        "error".to_string()
    } else if cli.verbose > 0 {
        "debug".to_string()
    } else {
        settings.logging.level.clone()
    };
    init_tracing(&TracingConfig {
        level,
        json_format: settings.logging.json,
    });

    let work_dir = settings.paths.work.clone();
    let app = match App::build(settings) {
        Ok(app) => app,
        Err(e) => exit_with(&work_dir, e),
    };

    if let Err(e) = app.dispatch(cli.command).await {
        exit_with(&work_dir, e);
    }
}

fn exit_with(work_dir: &str, error: AppError) -> ! {
    eprintln!("error: {}", error);
    if let AppError::Internal(_) = &error {
        log_fatal(work_dir, &error);
    }
    std::process::exit(error.exit_code());
}
