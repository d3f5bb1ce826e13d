#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

use retriever::config::{EngineConfig, SamplingConfig};
use retriever::providers::{create_provider, ProviderClient};
use retriever::session::{Role, SessionManager, Turn};

/// Durable multi-provider chat sessions from the terminal.
#[derive(Parser, Debug)]
#[command(name = "retriever")]
#[command(version, about = "WAL-backed chat sessions over interchangeable LLM backends", long_about = None)]
struct Cli {
    /// Resume a stored session, or start a new one under this id
    #[arg(long)]
    session_id: Option<String>,

    /// Backend to talk to: gemini, openai, or llama
    #[arg(long)]
    provider: Option<String>,

    /// Backend model name (each provider has its own default)
    #[arg(long)]
    model: Option<String>,

    /// Nucleus sampling cutoff
    #[arg(long)]
    top_p: Option<f64>,

    /// Top-k sampling cutoff (ignored by backends without it)
    #[arg(long)]
    top_k: Option<u32>,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f64>,

    /// Where snapshots and write-ahead logs live
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to INFO.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let sampling = SamplingConfig {
        top_p: cli.top_p,
        top_k: cli.top_k,
        temperature: cli.temperature,
    };
    let config = EngineConfig::resolve(cli.provider, cli.model, sampling, cli.data_dir)?;
    let provider: Arc<dyn ProviderClient> = Arc::from(create_provider(&config)?);

    println!("{}", provider.ready_message());

    let mut manager = SessionManager::new(provider, config);
    let session = manager.initialize_from_cli(cli.session_id)?;
    println!(
        "session {} ({} turns). Type a message, /help for commands.",
        session.id(),
        session.history().await.len()
    );

    let result = repl(&mut manager).await;

    // Flush everything we touched, even when the loop errored out.
    manager.cleanup_and_save().await;
    result
}

async fn repl(manager: &mut SessionManager) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                tracing::info!("interrupt received; saving sessions");
                return Ok(());
            }
        };

        let Some(line) = line else {
            return Ok(()); // stdin closed
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" => return Ok(()),
            "/help" => print_help(),
            _ if input.starts_with('/') => {
                if let Err(e) = run_command(manager, input).await {
                    eprintln!("error: {e}");
                }
            }
            _ => {
                let session = manager.active_session()?;
                match session.send_message(input).await {
                    Ok(outcome) => {
                        if let Some(fault) = &outcome.fault {
                            tracing::warn!(error = %fault, "reply degraded");
                        }
                        println!("{}", outcome.text);
                        println!(
                            "[tokens: {} used, {} remaining of {}]",
                            outcome.token_info.total,
                            outcome.token_info.remaining,
                            outcome.token_info.max
                        );
                    }
                    Err(e) => eprintln!("error: {e}"),
                }
            }
        }
    }
}

async fn run_command(manager: &mut SessionManager, input: &str) -> Result<()> {
    let mut words = input.split_whitespace();
    let command = words.next().unwrap_or_default();
    if command != "/session" {
        anyhow::bail!("unknown command '{command}'; try /help");
    }

    match (words.next().unwrap_or("display"), words.next()) {
        ("list", _) => {
            let sessions = manager.list_sessions();
            if sessions.is_empty() {
                println!("no stored sessions");
            }
            for meta in sessions {
                match meta.error {
                    Some(e) => println!("  {}  (unreadable: {e})", meta.id),
                    None => println!(
                        "  {}  {} turns, last active {}",
                        meta.id,
                        meta.turns,
                        meta.last_activity.as_deref().unwrap_or("never")
                    ),
                }
            }
        }
        ("display", _) => {
            let session = manager.active_session()?;
            let info = session.token_info().await;
            let history = session.history().await;
            println!(
                "session {} on {} ({} turns, {} tokens used of {})",
                session.id(),
                session.provider().name(),
                history.len(),
                info.total,
                info.max
            );
            for line in render_history(&history) {
                println!("{line}");
            }
        }
        ("new", _) => {
            let session = manager.create_new_session(true).await?;
            println!("started session {}", session.id());
        }
        ("switch", Some(id)) => {
            let session = manager.switch_session(id).await?;
            println!(
                "switched to session {} ({} turns)",
                session.id(),
                session.history().await.len()
            );
        }
        ("switch", None) => anyhow::bail!("usage: /session switch <id>"),
        ("remove", Some(id)) => {
            manager.remove_session(id).await?;
            println!("removed session {id}");
            if !manager.has_active_session() {
                let session = manager.create_new_session(false).await?;
                println!("started session {}", session.id());
            }
        }
        ("remove", None) => {
            let (removed, fresh) = manager.remove_active_and_create_new().await?;
            println!("removed session {removed}; started session {}", fresh.id());
        }
        ("pop", _) => {
            let session = manager.active_session()?;
            if session.pop_last_exchange(manager.store()).await? {
                println!("dropped the last exchange");
            } else {
                println!("nothing to drop");
            }
        }
        ("clear", _) => {
            let session = manager.active_session()?;
            session.clear_history(manager.store()).await?;
            println!("history cleared");
        }
        (other, _) => anyhow::bail!("unknown subcommand '/session {other}'; try /help"),
    }
    Ok(())
}

/// One line per turn, in conversation order.
fn render_history(history: &[Turn]) -> Vec<String> {
    history
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                Role::User => "you",
                Role::Assistant => "assistant",
            };
            format!("  {speaker}: {}", turn.text)
        })
        .collect()
}

fn print_help() {
    println!(
        "commands:\n  \
         /session list          stored sessions\n  \
         /session display       active session summary\n  \
         /session new           save current, start fresh\n  \
         /session switch <id>   save current, resume <id>\n  \
         /session remove [id]   delete a session (active by default)\n  \
         /session pop           drop the last exchange\n  \
         /session clear         wipe the conversation\n  \
         /quit                  save and exit"
    );
}
