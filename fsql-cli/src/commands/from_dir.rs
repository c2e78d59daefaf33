//! `fsql from-dir` - run every migration file under a directory.

use crate::cli::FromDirArgs;
use crate::commands::{Stages, run_sources};
use crate::config::Config;
use crate::discovery::discover_sql_files;
use crate::error::CliResult;
use crate::loader::{load_sources, source_path};
use crate::output;

/// Run the from-dir command
pub async fn run(args: FromDirArgs, config: Config) -> CliResult<()> {
    output::header("Run Migrations");

    let directory = args
        .directory
        .clone()
        .unwrap_or_else(|| config.migrations.directory.clone());
    output::kv("Directory", &directory.display().to_string());
    output::newline();

    let mut stages = Stages::new(6);

    let files = stages.run("Discovering files", || discover_sql_files(&directory))?;
    if files.is_empty() {
        output::warn("No migration files found");
    }

    let loaded = stages
        .run_async("Loading files", load_sources(&files))
        .await;
    for failure in &loaded.failures {
        output::warn(&format!(
            "Failed to load SQL file: {} ({})",
            failure.path.display(),
            failure.error
        ));
    }

    run_sources(
        loaded.sources,
        Some(source_path(&directory)),
        &config,
        &args.run,
        &mut stages,
    )
    .await
}
