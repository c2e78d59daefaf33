//! fsql - run annotated SQL migrations in dependency order.

use clap::Parser;
use miette::Diagnostic;

use fsql_cli::cli::{Cli, Command};
use fsql_cli::commands;
use fsql_cli::config::Config;
use fsql_cli::error::CliResult;
use fsql_cli::{logging, output};

#[tokio::main]
async fn main() {
    // .env is optional
    let _ = dotenvy::dotenv();
    logging::init();

    if let Err(e) = run().await {
        output::newline();
        output::error(&e.to_string());
        if let Some(related) = e.related() {
            for detail in related {
                output::error_item(&detail.to_string());
            }
        }
        if let Some(help) = e.help() {
            output::dim(&help.to_string());
        }
        std::process::exit(e.exit_code());
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let cwd = std::env::current_dir()?;
    let config = Config::discover(cli.config.as_deref(), &cwd)?;

    match cli.command {
        Command::FromDir(args) => commands::from_dir::run(args, config).await,
        Command::FromFile(args) => commands::from_file::run(args, config).await,
    }
}
