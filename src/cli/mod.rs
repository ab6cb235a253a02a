use anyhow::{anyhow, Result};
use std::path::Path;

pub mod args;

pub use args::{Cli, CliCommand, DispatchCliArgs, MeetingsCliArgs, OnceCliArgs};

use crate::app::Services;
use crate::config::Config;
use crate::db::{Meeting, MeetingFilter, MeetingRepository, Store};
use crate::meeting::MeetingStatus;
use crate::reconcile::{DispatchOutcome, WithdrawOutcome};

pub async fn handle_meetings_command(config_path: Option<&Path>, args: MeetingsCliArgs) -> Result<()> {
    let config = Config::load(config_path)?;
    let store = Store::open(&config.database_path()?)?;

    let status = args
        .status
        .as_deref()
        .map(MeetingStatus::parse)
        .transpose()?;
    let filter = MeetingFilter {
        account_id: args.account,
        status,
        limit: Some(args.limit),
    };

    let meetings = {
        let conn = store.lock().await;
        MeetingRepository::list(&conn, &filter)?
    };

    if meetings.is_empty() {
        println!("No meetings found matching your criteria.");
        return Ok(());
    }

    println!("Found {} meeting(s):\n", meetings.len());
    for meeting in &meetings {
        print_meeting(meeting);
    }

    Ok(())
}

fn print_meeting(meeting: &Meeting) {
    println!("ID: {}", meeting.id);
    println!("Event: {} ({})", meeting.calendar_event_id, meeting.account_id);
    println!("Status: {}", meeting.status);
    println!("Bot: {}", meeting.bot_id.as_deref().unwrap_or("-"));
    if let Some(started) = meeting.started_at {
        println!("Started: {}", started.format("%Y-%m-%d %H:%M UTC"));
    }
    if let Some(error) = &meeting.error {
        println!("Error: {}", error);
    }
    println!("---");
}

pub async fn handle_dispatch_command(config_path: Option<&Path>, args: DispatchCliArgs) -> Result<()> {
    let config = Config::load(config_path)?;
    let services = Services::build(config).await?;

    let result = if args.withdraw {
        withdraw(&services, &args.event_id).await
    } else {
        dispatch(&services, &args.event_id).await
    };

    services.shutdown().await;
    result
}

async fn dispatch(services: &Services, event_id: &str) -> Result<()> {
    match services.reconciler.request_dispatch(event_id).await? {
        DispatchOutcome::Created { meeting_id, bot_id } => {
            println!("Created bot {} for meeting #{}", bot_id, meeting_id);
        }
        DispatchOutcome::Linked {
            meeting_id,
            bot_id,
            status,
        } => {
            println!("Linked existing bot {} to meeting #{} ({})", bot_id, meeting_id, status);
        }
        DispatchOutcome::AlreadySatisfied { meeting_id } => {
            println!("Event already has meeting #{}", meeting_id);
        }
        DispatchOutcome::AlreadyClaimed { bot_id } => {
            println!("Event was claimed concurrently; bot {} was not kept", bot_id);
        }
        DispatchOutcome::NotEligible { reason } => {
            return Err(anyhow!("Cannot dispatch {}: {}", event_id, reason));
        }
    }
    Ok(())
}

async fn withdraw(services: &Services, event_id: &str) -> Result<()> {
    match services.reconciler.withdraw_dispatch(event_id).await? {
        WithdrawOutcome::EventNotFound => return Err(anyhow!("Event {} not found", event_id)),
        WithdrawOutcome::NoMeeting => println!("Request cleared; no bot had been dispatched"),
        WithdrawOutcome::Cancelled {
            meeting_id,
            bot_deleted,
        } => {
            println!("Meeting #{} cancelled", meeting_id);
            if !bot_deleted {
                println!("Warning: the bot could not be deleted from the directory");
            }
        }
        WithdrawOutcome::AlreadyStarted { meeting_id, status } => {
            println!(
                "Request cleared, but meeting #{} is already {} and keeps going",
                meeting_id, status
            );
        }
    }
    Ok(())
}
