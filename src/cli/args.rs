use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::scheduler::Task;

#[derive(Parser, Debug)]
#[command(name = "notetaker")]
#[command(about = "Meeting-recording bot scheduler", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file to use instead of the default location
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the scheduler and API server (the default)
    Run,
    /// Run a single tick of one task, wait for queued work, then exit
    Once(OnceCliArgs),
    /// List recorded meetings
    Meetings(MeetingsCliArgs),
    /// Request or withdraw a bot for a calendar event
    Dispatch(DispatchCliArgs),
    /// Print version information
    Version,
}

#[derive(ClapArgs, Debug)]
pub struct OnceCliArgs {
    #[arg(value_enum)]
    pub task: Task,
}

#[derive(ClapArgs, Debug)]
pub struct MeetingsCliArgs {
    /// Only meetings of this account
    #[arg(short, long)]
    pub account: Option<String>,
    /// Only meetings in this status (scheduled, recording, processing, ready, failed, cancelled)
    #[arg(short, long)]
    pub status: Option<String>,
    /// Maximum number of results to show
    #[arg(short, long, default_value = "20")]
    pub limit: usize,
}

#[derive(ClapArgs, Debug)]
pub struct DispatchCliArgs {
    /// Calendar event id
    pub event_id: String,
    /// Withdraw the request instead
    #[arg(long)]
    pub withdraw: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_once_task() {
        let cli = Cli::parse_from(["notetaker", "once", "discover", "-v"]);
        assert!(cli.verbose);
        match cli.command {
            Some(CliCommand::Once(args)) => assert_eq!(args.task, Task::Discover),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_dispatch_withdraw() {
        let cli = Cli::parse_from(["notetaker", "--config", "/tmp/n.toml", "dispatch", "evt-1", "--withdraw"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/n.toml")));
        match cli.command {
            Some(CliCommand::Dispatch(args)) => {
                assert_eq!(args.event_id, "evt-1");
                assert!(args.withdraw);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_meetings_defaults() {
        let cli = Cli::parse_from(["notetaker", "meetings"]);
        match cli.command {
            Some(CliCommand::Meetings(args)) => {
                assert_eq!(args.limit, 20);
                assert!(args.status.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
