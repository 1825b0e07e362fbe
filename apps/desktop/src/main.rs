use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    ApiJobQueue, ClientEvent, ClientSettings, Controller, MissingApiConnector, MissingJobRunner,
    SyncTimers,
};
use storage::Storage;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Offline inspector for the local secure inbox store")]
struct Args {
    /// TOML settings file; APP__* environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the locally stored sources, most recently updated first.
    Sources,
    /// Print every draft reply with its send status.
    Drafts,
    /// Print the time of the last successful sync.
    LastSync,
    /// Run the sync timers and log controller events until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let settings = ClientSettings::load(args.config.as_deref())?;
    settings.ensure_home_dir()?;
    let store = Arc::new(
        Storage::new(&settings.database_url())
            .await
            .context("failed to open local store")?,
    );
    let queue = Arc::new(ApiJobQueue::new(Arc::new(MissingJobRunner)));
    let controller = Controller::new(
        &settings,
        store.clone(),
        Arc::new(MissingApiConnector),
        queue,
    );
    let mut events = controller.subscribe_events();
    let (handle, task) = controller.spawn();
    handle.login_offline()?;

    match args.command {
        Command::Sources => {
            let sources = loop {
                if let ClientEvent::SourcesUpdated(sources) = next_event(&mut events).await? {
                    break sources;
                }
            };
            println!("{}", serde_json::to_string_pretty(&sources)?);
        }
        Command::Drafts => {
            // Offline login has swept pending drafts once the sources arrive.
            while !matches!(next_event(&mut events).await?, ClientEvent::SourcesUpdated(_)) {}
            let drafts = store.list_draft_replies().await?;
            println!("{}", serde_json::to_string_pretty(&drafts)?);
        }
        Command::LastSync => {
            handle.refresh_sync_display()?;
            let last_sync = loop {
                if let ClientEvent::LastSync(at) = next_event(&mut events).await? {
                    break at;
                }
            };
            println!("{}", serde_json::to_string(&last_sync)?);
        }
        Command::Watch => {
            let timers = SyncTimers::start(handle.clone(), &settings);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = next_event(&mut events) => {
                        let event = event?;
                        info!(?event, "controller event");
                    }
                }
            }
            timers.stop();
        }
    }

    handle.shutdown()?;
    task.await.context("controller task failed")?;
    Ok(())
}

async fn next_event(events: &mut broadcast::Receiver<ClientEvent>) -> Result<ClientEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Ok(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => bail!("controller stopped"),
        }
    }
}
