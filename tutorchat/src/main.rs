//! `TutorChat` line-mode client.
//!
//! Opens the room shared with one peer, prints its history, then sends each
//! typed line as a message. Logs go to a file so the terminal stays clean.
//!
//! ```bash
//! cargo run --bin tutorchat -- --url ws://127.0.0.1:9100/ws --token dev \
//!     --user-id s1 --display-name Sam --peer-id t1
//! ```
//!
//! Commands: `/image <url> [caption]`, `/file <url> [caption]`, `/retry`,
//! `/delete <n>`, `/requests`, `/quit`.

use std::path::Path;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use tutorchat::config::{CliArgs, ClientConfig};
use tutorchat::connection::ChatConnection;
use tutorchat::render;
use tutorchat::session::{ChatSession, SessionUpdate};
use tutorchat_proto::message::MessageKind;

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };
    let (me, peer) = match (config.local_user(), config.peer()) {
        (Ok(me), Ok(peer)) => (me, peer),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&config.log_level, config.log_file.as_deref());
    tracing::info!(user = %me, peer = %peer, url = %config.url, "tutorchat starting");

    let (connection, mut events) = match ChatConnection::connect(&config.connect_options(me.clone())).await {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("Could not connect to {}: {e}", config.url);
            std::process::exit(1);
        }
    };
    let display_name = config.display_name_or(&me);
    let mut session = match ChatSession::open(connection, me, display_name, peer).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Could not open chat: {e}");
            std::process::exit(1);
        }
    };

    println!("Chatting with {} in room {}", session.peer(), session.room());
    for (index, message) in session.messages().iter().enumerate() {
        println!("{}", render::message_line(index, message, session.me(), &config.timestamp_format));
    }

    run(&mut session, &mut events, &config).await;

    session.close();
    tracing::info!("tutorchat exiting");
}

/// Reads stdin lines and gateway events until `/quit`, EOF, or disconnect.
async fn run(
    session: &mut ChatSession<ChatConnection>,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<tutorchat_proto::event::ServerEvent>,
    config: &ClientConfig,
) {
    let format = config.timestamp_format.as_str();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim();
                match line.split_once(' ').map_or((line, ""), |(cmd, rest)| (cmd, rest.trim())) {
                    ("/quit", _) => break,
                    ("/retry", _) => match session.last_failed() {
                        Some(client_ref) => {
                            if let Err(e) = session.retry(client_ref).await {
                                println!("! {e}");
                            }
                            print_last(session, format);
                        }
                        None => println!("! nothing to retry"),
                    },
                    ("/delete", arg) => delete(session, arg),
                    (cmd @ ("/image" | "/file"), arg) => {
                        let kind = if cmd == "/image" { MessageKind::Image } else { MessageKind::File };
                        let (url, caption) = arg.split_once(' ').unwrap_or((arg, ""));
                        if url.is_empty() {
                            println!("! usage: {cmd} <url> [caption]");
                        } else {
                            let file_name = url.rsplit('/').next().map(str::to_string);
                            session.send_attachment(kind, url, file_name, caption.trim()).await;
                            print_last(session, format);
                        }
                    }
                    ("/requests", _) => match session.chat_requests().await {
                        Ok(requests) if requests.is_empty() => println!("No chat requests."),
                        Ok(requests) => {
                            for request in &requests {
                                println!("{}", render::request_line(request, format));
                            }
                        }
                        Err(e) => println!("! {e}"),
                    },
                    _ if line.is_empty() => {}
                    _ => match session.send_text(line).await {
                        Ok(_) => print_last(session, format),
                        Err(e) => println!("! {e}"),
                    },
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    println!("! disconnected from gateway");
                    break;
                };
                match session.apply(event) {
                    SessionUpdate::Appended(index) | SessionUpdate::Changed(index) => {
                        if let Some(message) = session.messages().get(index) {
                            println!("{}", render::message_line(index, message, session.me(), format));
                        }
                    }
                    SessionUpdate::Notification(notification) => {
                        println!("{}", render::notification_line(&notification));
                    }
                    SessionUpdate::Ignored => {}
                }
            }
        }
        if !session.link().is_connected() {
            println!("! connection lost");
            break;
        }
    }
}

fn delete(session: &ChatSession<ChatConnection>, arg: &str) {
    let Some(id) = arg
        .parse::<usize>()
        .ok()
        .and_then(|n| session.messages().get(n))
        .and_then(|m| m.id)
    else {
        println!("! usage: /delete <message number>");
        return;
    };
    if let Err(e) = session.delete(id) {
        println!("! {e}");
    }
}

fn print_last(session: &ChatSession<ChatConnection>, format: &str) {
    if let Some(index) = session.messages().len().checked_sub(1) {
        println!("{}", render::message_line(index, &session.messages()[index], session.me(), format));
    }
}

/// Initialize file-based logging.
///
/// Logs are written to a file (never stdout, which carries the chat).
/// Returns a guard that must be held for the lifetime of the program to
/// ensure buffered logs are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("tutorchat.log");
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
