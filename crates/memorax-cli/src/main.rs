mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version requests are not errors.
            if e.use_stderr() {
                let _ = e.print();
                std::process::exit(1);
            }
            let _ = e.print();
            std::process::exit(0);
        }
    };

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let json = cli.json;
    let result = match cli.command {
        Commands::Reach { .. } => commands::reach::run(cli.command, json),
        Commands::Fencins { .. } => commands::fencins::run(cli.command, json),
        Commands::Dotify { .. } => commands::dotify::run(cli.command),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(report) => {
            eprintln!("Error: {report:?}");
            std::process::exit(1);
        }
    }
}
