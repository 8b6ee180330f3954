use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{
    load_settings, ClientEvent, Collaborators, HttpDataClient, LogoutReason, NoScrollPreserver,
    SessionEngine, SessionNavigator, WsTransport,
};
use media_session::{MediaToggle, MissingMediaSession};
use shared::domain::{ChannelId, MessageId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from client.toml.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    /// Text channel to open after connecting.
    #[arg(long)]
    channel: Option<i64>,
}

struct CliNavigator {
    requested: Option<ChannelId>,
}

impl SessionNavigator for CliNavigator {
    fn requested_channel(&self) -> Option<ChannelId> {
        self.requested
    }

    fn force_logout(&self, reason: LogoutReason) {
        warn!(?reason, "desktop: session ended by server; log in again");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = client_core::config::normalize_server_url(&server_url);
    }
    if args.token.is_some() {
        settings.auth_token = args.token;
    }

    let engine = SessionEngine::new(
        settings.clone(),
        Collaborators {
            data: Arc::new(HttpDataClient::from_settings(&settings)),
            transport: Arc::new(WsTransport::new(&settings)?),
            media: Arc::new(MissingMediaSession::new()),
            navigator: Arc::new(CliNavigator {
                requested: args.channel.map(ChannelId),
            }),
            scroll: Arc::new(NoScrollPreserver),
        },
    );

    let mut events = engine.subscribe_events();
    engine.connect().await?;
    print_channel(&engine).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ClientEvent::LoggedOut(reason)) => {
                    println!("logged out: {reason:?}");
                    break;
                }
                Ok(ClientEvent::MessagesChanged { .. }) => print_channel(&engine).await,
                Ok(ClientEvent::Error(text)) => println!("! {text}"),
                Ok(other) => info!(?other, "desktop: client event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "desktop: event receiver lagged"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !run_command(&engine, line.trim()).await {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    engine.disconnect().await;
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn run_command(engine: &Arc<SessionEngine>, line: &str) -> bool {
    let mut parts = line.splitn(3, ' ');
    let result = match (parts.next(), parts.next(), parts.next()) {
        (Some("/quit"), _, _) => return false,
        (Some("/open"), Some(id), _) => match id.parse::<i64>() {
            Ok(id) => {
                engine.select_channel(ChannelId(id), format!("#{id}")).await;
                Ok(())
            }
            Err(err) => {
                println!("! bad channel id: {err}");
                Ok(())
            }
        },
        (Some("/older"), _, _) => {
            engine.load_older_messages().await;
            Ok(())
        }
        (Some("/react"), Some(id), Some(emoji)) => match id.parse::<i64>() {
            Ok(id) => engine.toggle_reaction(MessageId(id), emoji).await,
            Err(err) => {
                println!("! bad message id: {err}");
                Ok(())
            }
        },
        (Some("/voice"), Some(id), _) => match id.parse::<i64>() {
            Ok(id) => engine.join_voice(ChannelId(id)).await,
            Err(err) => {
                println!("! bad channel id: {err}");
                Ok(())
            }
        },
        (Some("/leave"), _, _) => engine.leave_voice().await,
        (Some("/mute"), _, _) => engine.toggle_media(MediaToggle::Mute).await,
        (Some(""), _, _) | (None, _, _) => Ok(()),
        _ => engine.send_message(line, &[]).await,
    };
    if let Err(err) = result {
        println!("! {err}");
    }
    true
}

async fn print_channel(engine: &SessionEngine) {
    let snapshot = engine.snapshot().await;
    let Some(name) = &snapshot.channel.channel_name else {
        return;
    };
    println!("--- {name} ---");
    for message in snapshot.channel.messages.iter().rev().take(10).rev() {
        println!(
            "[{}] {}: {}",
            message.message_id.0,
            message.author_display_name.as_deref().unwrap_or(&message.author_username),
            message.content
        );
    }
}
