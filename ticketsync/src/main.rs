//! `ticketsync`: headless client for the ticket desk sync core.
//!
//! Connects to a hub, keeps a live view of tickets and messages, and reads
//! commands from stdin. Every change the core reports is printed as one
//! line. Configuration via CLI flags, environment variables, or config file
//! (`~/.config/ticketsync/config.toml`).
//!
//! ```bash
//! cargo run --bin ticketsync-hub
//! cargo run --bin ticketsync -- --hub-url ws://127.0.0.1:9100/ws \
//!     --user agent-1 --name Dana --role agent
//! ```
//!
//! Commands: `/list`, `/open <ticket-id>`, `/close`, `/new <title>`,
//! `/status <status>`, `/read`, `/who`, `/quit`. Any other line is sent as a
//! message on the open ticket.

use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use ticketsync::backend::hub::HubBackend;
use ticketsync::config::{CliArgs, ClientConfig};
use ticketsync::optimistic::{Submitted, TicketDraft};
use ticketsync::{SyncCore, SyncEvent};
use ticketsync_proto::ids::TicketId;
use ticketsync_proto::record::{TicketPatch, TicketStatus};

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let hub_config = config.to_hub_config().map_err(io::Error::other)?;
    let identity = config.identity().map_err(io::Error::other)?;
    tracing::info!(user = %identity.user_id, hub = %hub_config.url, "ticketsync starting");

    let backend = Arc::new(HubBackend::new(hub_config));
    let core = SyncCore::new(backend, identity, config.sync.clone());
    let printer = tokio::spawn(print_events(
        core.clone(),
        config.timestamp_format.clone(),
    ));
    core.start();

    let result = run_commands(&core).await;

    core.stop().await;
    printer.abort();
    tracing::info!("ticketsync exiting");
    result
}

/// Initialize file-based logging.
///
/// Stdout belongs to the event printer, so logs go to a file. The returned
/// guard must live until shutdown so buffered lines are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("ticketsync.log");
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

async fn run_commands(core: &SyncCore<HubBackend>) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
        let arg = arg.trim();

        match command {
            "/quit" => break,
            "/list" => {
                for record in core.tickets() {
                    let t = &record.ticket;
                    let marker = if record.pending { " (pending)" } else { "" };
                    println!(
                        "{}  [{}] {} unread={}{marker}",
                        t.id,
                        t.status,
                        t.title,
                        core.unread_count(&t.id)
                    );
                }
            }
            "/open" => match arg.parse::<TicketId>() {
                Ok(id) => {
                    if let Err(e) = core.select_ticket(Some(id)) {
                        println!("! {e}");
                    }
                    for record in core.messages(&id) {
                        let m = &record.message;
                        println!("  {}: {}", m.author_name, m.body);
                    }
                }
                Err(e) => println!("! bad ticket id: {e}"),
            },
            "/close" => {
                let _ = core.select_ticket(None);
            }
            "/new" => match core.create_ticket(TicketDraft::titled(arg)) {
                Ok(submitted) => watch(submitted),
                Err(e) => println!("! {e}"),
            },
            "/status" => {
                let Some(ticket) = core.selected() else {
                    println!("! no ticket open");
                    continue;
                };
                match arg.parse::<TicketStatus>() {
                    Ok(status) => {
                        let patch = TicketPatch {
                            status: Some(status),
                            ..TicketPatch::default()
                        };
                        match core.mutate_ticket(ticket, patch) {
                            Ok(submitted) => watch(submitted),
                            Err(e) => println!("! {e}"),
                        }
                    }
                    Err(e) => println!("! {e}"),
                }
            }
            "/read" => {
                if let Some(ticket) = core.selected()
                    && let Err(e) = core.mark_read(ticket).await
                {
                    println!("! {e}");
                }
            }
            "/who" => {
                for entry in core.online_staff() {
                    println!("  {} ({})", entry.name, entry.role);
                }
            }
            _ => {
                let Some(ticket) = core.selected() else {
                    println!("! open a ticket first (/open <ticket-id>)");
                    continue;
                };
                core.notify_typing(ticket, false);
                match core.send_message(ticket, line) {
                    Ok(submitted) => watch(submitted),
                    Err(e) => println!("! {e}"),
                }
            }
        }
    }
    Ok(())
}

/// Reports a mutation's failure once it settles.
fn watch(submitted: Submitted) {
    tokio::spawn(async move {
        if let Err(failure) = submitted.settled().await {
            println!("! {} ({:?})", failure.error, failure.restore);
        }
    });
}

async fn print_events(core: SyncCore<HubBackend>, timestamp_format: String) {
    let mut events = core.events();
    while let Some(event) = events.recv().await {
        let now = chrono::Local::now().format(&timestamp_format);
        let line = match event {
            SyncEvent::TicketsChanged => format!("{} tickets", core.tickets().len()),
            SyncEvent::MessagesChanged { ticket_id } => match core.messages(&ticket_id).last() {
                Some(last) => format!(
                    "{}: {}{}",
                    last.message.author_name,
                    last.message.body,
                    if last.pending { " (sending)" } else { "" }
                ),
                None => continue,
            },
            SyncEvent::UnreadChanged { ticket_id, count } => {
                format!("unread {ticket_id}: {count}")
            }
            SyncEvent::PresenceChanged => format!("{} staff online", core.online_staff().len()),
            SyncEvent::TypingChanged { ticket_id } => {
                let typing = core.typing_users(&ticket_id);
                if typing.is_empty() {
                    continue;
                }
                format!("{} typing...", typing.join(", "))
            }
            SyncEvent::ConnectionChanged { current, .. } => format!("connection: {current}"),
            SyncEvent::SelectionClosed { ticket_id } => format!("ticket {ticket_id} went away"),
            SyncEvent::MutationConfirmed { local_id } => format!("{local_id} confirmed"),
            SyncEvent::MutationFailed {
                local_id, reason, ..
            } => format!("{local_id} failed: {reason}"),
            SyncEvent::MarkReadFailed { ticket_id, reason } => {
                format!("could not mark {ticket_id} read: {reason}")
            }
        };
        println!("[{now}] {line}");
    }
}
