//! `chatsync`: inspect the on-disk room cache and run local sync sessions.
//!
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/chatsync/config.toml`).
//!
//! ```bash
//! # Summarise (and repair if needed) the cached entry of a room
//! cargo run --bin chatsync -- inspect general
//!
//! # Drop every cached room
//! cargo run --bin chatsync -- clear
//!
//! # Run an in-memory session that syncs, sends and pages back
//! cargo run --bin chatsync -- demo general -m "hello" -m "again" --pages 2
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use tracing_appender::non_blocking::WorkerGuard;

use chatsync::cache::LocalCacheStore;
use chatsync::cache::store::{FileKv, StoreError};
use chatsync::config::{CliArgs, ClientConfig, Command};
use chatsync::gateway::memory::InMemoryGateway;
use chatsync::room::{RoomMessageState, SyncPhase};
use chatsync::sync::{SyncController, SyncError};
use chatsync_proto::message::{
    Draft, Message, MessageId, MessageStatus, OutgoingMessage, ParticipantId, RoomId, Timestamp,
};

/// Seeded history length of the demo room.
const DEMO_HISTORY: u64 = 45;

/// How long the demo waits for a snapshot to reflect a change.
const DEMO_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // CLI args > env > config file > defaults.
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let Some(command) = cli.command else {
        let _ = CliArgs::command().print_help();
        return ExitCode::FAILURE;
    };

    tracing::info!(?command, cache_dir = %config.cache_dir.display(), "chatsync starting");
    match run(command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Logs go to a file so that command output on stdout stays clean. Returns
/// a [`WorkerGuard`] that must be held until shutdown to flush buffered
/// entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("chatsync.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(command: Command, config: &ClientConfig) -> Result<(), CliError> {
    let kv = FileKv::open(&config.cache_dir).await?;
    let cache = LocalCacheStore::new(kv, config.cache_config());

    match command {
        Command::Inspect { room } => {
            inspect(&cache, &RoomId::new(room)).await;
            Ok(())
        }
        Command::Clear { room: Some(room) } => {
            cache.clear_room(&RoomId::new(room.as_str())).await;
            println!("cleared cache for room {room}");
            Ok(())
        }
        Command::Clear { room: None } => {
            cache.clear_all().await;
            println!("cleared all cached rooms in {}", cache.kv().dir().display());
            Ok(())
        }
        Command::Demo {
            room,
            messages,
            pages,
        } => demo(cache, config, RoomId::new(room), messages, pages).await,
    }
}

async fn inspect(cache: &LocalCacheStore<FileKv>, room: &RoomId) {
    if !cache.validate_and_repair(room).await {
        println!("room {room}: no usable cache entry");
        return;
    }
    let Some(entry) = cache.load(room).await else {
        println!("room {room}: no usable cache entry");
        return;
    };

    println!("room {room}");
    println!("  messages:     {}", entry.messages.len());
    println!("  written at:   {}", entry.written_at);
    println!(
        "  oldest:       {}",
        entry
            .metadata
            .oldest_timestamp
            .map_or_else(|| "-".to_string(), |t| t.to_string())
    );
    println!("  has more:     {}", entry.metadata.has_more);
    println!("  last updated: {}", entry.metadata.last_updated);
    for message in entry.messages.iter().rev().take(5).rev() {
        println!("  {}", format_message(message));
    }
}

async fn demo(
    cache: LocalCacheStore<FileKv>,
    config: &ClientConfig,
    room: RoomId,
    messages: Vec<String>,
    pages: usize,
) -> Result<(), CliError> {
    let gateway = InMemoryGateway::new();
    gateway.seed(&room, demo_history());

    let mut sync_config = config.sync_config();
    // A shallow snapshot leaves older history for pagination to find.
    sync_config.snapshot_limit.get_or_insert(config.page_size);

    let (controller, mut events) = SyncController::new(gateway, cache, sync_config);

    let outcome = controller.open_room(&room).await?;
    println!("open {room}: {outcome:?}");
    settle(&controller, &room, |s| s.phase == SyncPhase::Live).await;
    print_state(&room, &controller.get_state(&room).unwrap_or_default());

    for text in messages {
        let pending = controller.send(&room, Draft::text(text))?;
        println!("sending {} ({})", pending.message().text, pending.temp_id());
        let id = pending.wait().await?;
        settle(&controller, &room, |s| {
            s.messages.iter().any(|m| m.id == id)
        })
        .await;
        println!("confirmed as {id}");
    }

    for _ in 0..pages {
        let outcome = controller.load_older(&room).await?;
        println!("load older: {outcome:?}");
    }

    controller
        .mark_seen(&room, &controller.config().participant)
        .await?;

    print_state(&room, &controller.get_state(&room).unwrap_or_default());

    while let Ok(event) = events.try_recv() {
        println!("event: {event:?}");
    }
    controller.close_room(&room);
    Ok(())
}

/// Wait until a room's state satisfies `done`, or give up after a while.
async fn settle(
    controller: &Arc<SyncController<InMemoryGateway, FileKv>>,
    room: &RoomId,
    done: impl FnMut(&RoomMessageState) -> bool,
) {
    let Some(mut rx) = controller.watch(room) else {
        return;
    };
    if tokio::time::timeout(DEMO_SETTLE_TIMEOUT, rx.wait_for(done))
        .await
        .is_err()
    {
        tracing::warn!(room_id = %room, "room did not settle in time");
    }
}

fn demo_history() -> Vec<Message> {
    let now = Timestamp::now().as_millis();
    (0..DEMO_HISTORY)
        .map(|i| {
            let created_at = now.saturating_sub((DEMO_HISTORY - i) * 60_000);
            OutgoingMessage::from_draft(
                Draft::text(format!("history message {i}")),
                ParticipantId::new("demo-peer"),
                Timestamp::from_millis(created_at),
            )
            .into_message(
                MessageId::new(format!("seed-{i}")),
                MessageStatus::Delivered,
            )
        })
        .collect()
}

fn print_state(room: &RoomId, state: &RoomMessageState) {
    println!(
        "{room}: {} messages, phase {:?}, loading {}, has_more {}, error {}",
        state.messages.len(),
        state.phase,
        state.loading,
        state.has_more,
        state.error.as_deref().unwrap_or("-"),
    );
    for message in state.messages.iter().rev().take(5).rev() {
        println!("  {}", format_message(message));
    }
}

fn format_message(message: &Message) -> String {
    format!(
        "[{}] {} {:?}: {}",
        message.created_at, message.sender_id, message.status, message.text
    )
}
