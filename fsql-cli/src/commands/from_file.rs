//! `fsql from-file` - run the migrations of one SQL file.

use crate::cli::FromFileArgs;
use crate::commands::{Stages, run_sources};
use crate::config::Config;
use crate::error::{CliError, CliResult};
use crate::loader::load_file;
use crate::output;

/// Run the from-file command
pub async fn run(args: FromFileArgs, config: Config) -> CliResult<()> {
    output::header("Run Migration File");
    output::kv("File", &args.path.display().to_string());
    output::newline();

    let mut stages = Stages::new(5);

    let source = stages.run_async("Loading file", load_file(&args.path)).await?;
    if source.content.trim().is_empty() {
        return Err(CliError::EmptyFile(args.path));
    }

    run_sources(vec![source], None, &config, &args.run, &mut stages).await
}
