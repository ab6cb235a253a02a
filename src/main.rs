use anyhow::Result;
use clap::Parser;
use notetaker::{
    app,
    cli::{handle_dispatch_command, handle_meetings_command, Cli, CliCommand},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Some(CliCommand::Version) => {
            println!("Notetaker {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(CliCommand::Meetings(args)) => handle_meetings_command(config_path, args).await,
        Some(CliCommand::Dispatch(args)) => handle_dispatch_command(config_path, args).await,
        Some(CliCommand::Once(args)) => {
            let report = app::run_once(config_path, args.task).await?;
            println!("{}: {}", args.task, report);
            Ok(())
        }
        Some(CliCommand::Run) | None => app::run_service(config_path).await,
    }
}
