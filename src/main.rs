//! ShopChat CLI - Lightweight support-messenger client
//!
//! Terminal client for the ShopChat customer-support chat. Keeps a local
//! copy of the conversation that survives restarts and stays consistent
//! across history pulls and live push deliveries.

mod api;
mod cache;
mod config;
mod models;
mod push;
mod store;
mod transport;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{ApiClient, HttpTransport};
use crate::cache::{ChatSnapshot, FileCache, SnapshotCache};
use crate::config::Config;
use crate::models::{Message, MessageId, MessageKind};
use crate::push::{PushChannel, PushIdentity};
use crate::store::ChatStore;
use crate::transport::Draft;

#[derive(Parser)]
#[command(name = "shopchat-cli")]
#[command(about = "Lightweight CLI client for the ShopChat support messenger", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store API credentials (token issuance happens in the web dashboard)
    Login {
        /// API token
        #[arg(long)]
        token: String,

        /// Your user id on the platform
        #[arg(long)]
        user_id: String,

        /// Display name shown on your outgoing messages
        #[arg(long)]
        name: Option<String>,

        /// API endpoint override
        #[arg(long)]
        url: Option<String>,

        /// Push endpoint override
        #[arg(long)]
        push_url: Option<String>,
    },

    /// Clear stored credentials and the local conversation cache
    Logout,

    /// Show credential and cache status
    Status,

    /// Show the conversation history
    History {
        /// Conversation id (defaults to your own support conversation)
        chat_id: Option<String>,
    },

    /// Send a message
    Send {
        /// Message content
        message: String,

        /// Conversation id (defaults to the cached conversation)
        #[arg(short, long)]
        to: Option<String>,

        /// Attach an already-uploaded file by URL
        #[arg(long)]
        file_url: Option<String>,

        /// File name shown for the attachment
        #[arg(long)]
        file_name: Option<String>,

        /// File size in bytes
        #[arg(long)]
        file_size: Option<u64>,
    },

    /// Follow the conversation live; typed lines are sent as replies
    Watch {
        /// Conversation id (defaults to your own support conversation)
        chat_id: Option<String>,
    },

    /// Mark one message as read
    Read {
        /// Canonical message id
        id: String,
    },

    /// Mark the whole conversation as read
    ReadAll,

    /// Wipe the local conversation cache
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Login {
            token,
            user_id,
            name,
            url,
            push_url,
        } => {
            login(token, user_id, name, url, push_url)?;
        }
        Commands::Logout => {
            logout()?;
        }
        Commands::Status => {
            status()?;
        }
        Commands::History { chat_id } => {
            show_history(chat_id).await?;
        }
        Commands::Send {
            message,
            to,
            file_url,
            file_name,
            file_size,
        } => {
            send_message(message, to, file_url, file_name, file_size).await?;
        }
        Commands::Watch { chat_id } => {
            watch(chat_id).await?;
        }
        Commands::Read { id } => {
            mark_read(id).await?;
        }
        Commands::ReadAll => {
            mark_all_read().await?;
        }
        Commands::Clear => {
            clear_cache()?;
        }
    }

    Ok(())
}

/// Build the conversation store from stored credentials.
fn build_store(config: &Config) -> Result<ChatStore<FileCache, HttpTransport>> {
    let cache = FileCache::new()?;
    let client = ApiClient::new(config)?;
    Ok(ChatStore::new(
        config.user_id()?,
        config.user_name(),
        cache,
        HttpTransport::new(client),
    ))
}

fn login(
    token: String,
    user_id: String,
    name: Option<String>,
    url: Option<String>,
    push_url: Option<String>,
) -> Result<()> {
    let mut config = Config::load()?;
    config.api_token = Some(token);
    config.user_id = Some(user_id);
    if name.is_some() {
        config.user_name = name;
    }
    if url.is_some() {
        config.base_url = url;
    }
    if push_url.is_some() {
        config.push_url = push_url;
    }
    if config.device_id.is_none() {
        config.device_id = Some(uuid::Uuid::new_v4().to_string());
    }
    config.save()?;

    println!("Credentials stored.");
    Ok(())
}

fn logout() -> Result<()> {
    let mut config = Config::load()?;
    config.clear_credentials();
    config.save()?;

    // A fresh login may be a different identity; drop the cached
    // conversation along with the credentials.
    let cache = FileCache::new()?;
    cache.save(ChatSnapshot::default());
    cache.flush();

    println!("Logged out.");
    Ok(())
}

fn status() -> Result<()> {
    let config = Config::load()?;

    println!("Endpoint: {}", config.base_url());
    match config.user_id {
        Some(ref id) if config.api_token.is_some() => {
            println!("Logged in as {} ({})", config.user_name(), id);
        }
        _ => {
            println!("Not logged in. Run 'shopchat-cli login'.");
            return Ok(());
        }
    }

    let cache = FileCache::new()?;
    match cache.load() {
        Some(snapshot) => println!(
            "Cached: {} messages, {} unread",
            snapshot.messages.len(),
            snapshot.unread_count
        ),
        None => println!("Cached: (empty)"),
    }

    Ok(())
}

async fn show_history(chat_id: Option<String>) -> Result<()> {
    let config = Config::load()?;
    let store = build_store(&config)?;
    store.hydrate();

    match store.refresh(chat_id.as_deref()).await {
        Ok(resolved) => tracing::debug!("History refreshed for {}", resolved),
        Err(e) => {
            if store.messages().is_empty() {
                return Err(e.into());
            }
            tracing::warn!("Refresh failed, showing cached messages: {}", e);
        }
    }

    let messages = store.messages();
    if messages.is_empty() {
        println!("(no messages)");
        return Ok(());
    }
    for message in &messages {
        println!("{}", format_message(message));
    }
    let unread = store.unread_count();
    if unread > 0 {
        println!("\n{} unread", unread);
    }

    Ok(())
}

async fn send_message(
    message: String,
    to: Option<String>,
    file_url: Option<String>,
    file_name: Option<String>,
    file_size: Option<u64>,
) -> Result<()> {
    let config = Config::load()?;
    let store = build_store(&config)?;
    store.hydrate();

    // An explicit conversation id means adopting that conversation first.
    if let Some(ref id) = to {
        if store.chat_id().as_deref() != Some(id.as_str()) {
            store.refresh(Some(id)).await?;
        }
    }

    let mut draft = Draft::text(message);
    if file_url.is_some() {
        draft.kind = MessageKind::File;
        draft.file_url = file_url;
        draft.file_name = file_name;
        draft.file_size = file_size;
    }

    store.send(draft).await?;
    println!("Message sent.");
    Ok(())
}

async fn watch(chat_id: Option<String>) -> Result<()> {
    let config = Config::load()?;
    let store = build_store(&config)?;
    store.hydrate();

    if let Err(e) = store.refresh(chat_id.as_deref()).await {
        tracing::warn!("Initial refresh failed, starting from cache: {}", e);
    }
    for message in &store.messages() {
        println!("{}", format_message(message));
    }

    let identity = PushIdentity::from_config(&config)?;
    let (mut channel, mut events) = PushChannel::new(identity);
    let mut state_rx = channel.watch_state();
    channel.connect();

    println!("Listening for new messages; type a line to reply. (Ctrl-C to stop)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                let line = format_message(&event.message);
                store.receive_push(event);
                println!("{}", line);
            }
            changed = state_rx.changed() => {
                if changed.is_ok() {
                    tracing::info!("Push channel {}", state_rx.borrow().as_str());
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        // Replies go out over the live channel; the canonical
                        // message comes back as a push event and merges in.
                        let chat_id = store.chat_id().unwrap_or_default();
                        let payload = serde_json::json!({
                            "content": line.trim(),
                            "type": "text",
                        });
                        if let Err(e) = channel.send(&chat_id, payload).await {
                            tracing::warn!("Reply not sent: {:#}", e);
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        tracing::debug!("stdin error: {}", e);
                        stdin_open = false;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    channel.shutdown().await;
    Ok(())
}

async fn mark_read(id: String) -> Result<()> {
    let config = Config::load()?;
    let store = build_store(&config)?;
    store.hydrate();

    store.mark_read(&MessageId::Canonical(id)).await?;
    println!("Marked read.");
    Ok(())
}

async fn mark_all_read() -> Result<()> {
    let config = Config::load()?;
    let store = build_store(&config)?;
    store.hydrate();

    store.mark_all_read().await?;
    println!("Conversation marked read.");
    Ok(())
}

fn clear_cache() -> Result<()> {
    let cache = FileCache::new()?;
    cache.save(ChatSnapshot::default());
    cache.flush();

    println!("Local conversation cache cleared.");
    Ok(())
}

/// One line per message for terminal output.
fn format_message(message: &Message) -> String {
    let time = message.timestamp.format("%Y-%m-%d %H:%M");
    let mut line = match message.kind {
        MessageKind::Text => {
            format!("[{}] {}: {}", time, message.sender_name, message.content)
        }
        MessageKind::Image | MessageKind::File => {
            let name = message
                .file_name
                .as_deref()
                .or(message.file_url.as_deref())
                .unwrap_or("attachment");
            format!("[{}] {}: <{}>", time, message.sender_name, name)
        }
    };
    if let Some(ref reply) = message.reply_to {
        line.push_str(&format!("  (re {}: {})", reply.sender_name, reply.content));
    }
    line
}
