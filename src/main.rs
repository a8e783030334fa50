use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use methq::commands;
use methq::config::{Cli, Commands, CommonArgs};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.common.make_config {
        methq::config::write_template(path)?;
        println!("wrote config template to {}", path.display());
        return Ok(());
    }

    init_tracing(&cli.common)?;

    let Some(command) = cli.command else {
        anyhow::bail!("no subcommand given; run with --help for usage");
    };

    match command {
        Commands::Index(args) => commands::index::run(args),
        Commands::Format(args) => commands::format::run(args),
        Commands::Check(args) => commands::check::run(args),
        Commands::Merge(args) => commands::merge::run(args),
        Commands::Compress(args) => commands::compress::run(args),
        Commands::Bins(args) => commands::bins::run(args),
        Commands::Intervals(args) => commands::intervals::run(args),
        Commands::Server(args) => commands::server::run(args, &cli.common),
        Commands::Config(args) => commands::config::run(args),
    }
}

fn init_tracing(common: &CommonArgs) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(common.log_level.as_filter()));
    let registry = tracing_subscriber::registry().with(filter);
    match &common.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::sync::Arc::new(file))
                        .with_ansi(false),
                )
                .init();
        }
        None => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}
