//! Client-side real-time state engine.
//!
//! [`SessionEngine`] keeps an in-memory view of channels, messages, presence,
//! typing and voice participants consistent across a bootstrap snapshot, the
//! live event stream and locally issued commands. All inbound stream events,
//! media pushes and timer expiries funnel through one queue and are applied in
//! receipt order; fetch completions re-check the context that motivated them
//! before touching state.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use media_session::{MediaEvent, MediaSession};
use shared::{
    domain::{ChannelId, ChannelKind, FileId, MessageId, UserId},
    protocol::{BootstrapSnapshot, ChannelSummary, MessagePayload, ServerEvent},
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

pub mod config;
mod connector;
mod dispatcher;
pub mod error;
pub mod http_client;
mod messages;
mod presence;
pub mod state;
mod supervisor;
pub mod timers;
pub mod transport;
mod voice;

pub use config::{load_settings, ClientSettings};
pub use error::{is_auth_expired, ClientError};
pub use http_client::HttpDataClient;
pub use messages::merge_page;
pub use state::{
    Banner, ChannelSession, EngineSnapshot, PresenceSet, SessionPhase, TypingEntry, VoiceState,
    WatchKind,
};
pub use transport::WsTransport;

use state::{ResetScope, SessionContext, TimerKey};

/// Snapshot and command surface of the server's REST-style API.
#[async_trait]
pub trait DataFetchClient: Send + Sync {
    async fn bootstrap(&self) -> Result<BootstrapSnapshot>;
    async fn list_channels(&self) -> Result<Vec<ChannelSummary>>;
    /// Up to `limit` messages, oldest first, strictly older than `before` when given.
    async fn fetch_messages(
        &self,
        channel_id: ChannelId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessagePayload>>;
    async fn create_channel(&self, name: &str, kind: ChannelKind) -> Result<ChannelSummary>;
    async fn rename_channel(&self, channel_id: ChannelId, name: &str) -> Result<()>;
    async fn delete_channel(&self, channel_id: ChannelId) -> Result<()>;
    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> Result<()>;
    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> Result<()>;
    async fn add_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<()>;
    async fn remove_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<()>;
    fn avatar_url(&self, user_id: UserId) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendAck {
    Accepted,
    Rejected { reason: String },
}

pub trait StreamEventHandler: Send + Sync {
    fn on_event(&self, event: ServerEvent);
}

pub trait ReconnectHandler: Send + Sync {
    fn on_reconnected(&self);
}

/// Persistent bidirectional stream to the server.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Opens the stream. Must be a no-op when already connected.
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    fn join_channel(&self, channel_id: ChannelId) -> Result<()>;
    async fn send_message(
        &self,
        channel_id: ChannelId,
        content: &str,
        attachment_ids: &[FileId],
        reply_to: Option<MessageId>,
    ) -> Result<SendAck>;
    fn send_typing(&self, channel_id: ChannelId) -> Result<()>;
    /// Replaces any previously registered handler.
    fn set_event_handler(&self, handler: Arc<dyn StreamEventHandler>);
    fn clear_event_handler(&self);
    fn set_reconnect_handler(&self, handler: Arc<dyn ReconnectHandler>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    AuthExpired,
    Kicked,
    Banned,
}

/// Routing and auth surface of the host application.
pub trait SessionNavigator: Send + Sync {
    /// Channel the current route asks for, read once per bootstrap.
    fn requested_channel(&self) -> Option<ChannelId>;
    /// Drop credentials and send the user back to the login screen.
    fn force_logout(&self, reason: LogoutReason);
}

/// Keeps the viewport anchored while older history is spliced in above it.
pub trait ScrollPreserver: Send + Sync {
    fn capture(&self);
    fn restore(&self);
}

pub struct NoScrollPreserver;

impl ScrollPreserver for NoScrollPreserver {
    fn capture(&self) {}
    fn restore(&self) {}
}

pub struct Collaborators {
    pub data: Arc<dyn DataFetchClient>,
    pub transport: Arc<dyn StreamTransport>,
    pub media: Arc<dyn MediaSession>,
    pub navigator: Arc<dyn SessionNavigator>,
    pub scroll: Arc<dyn ScrollPreserver>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    PhaseChanged(SessionPhase),
    ChannelsChanged,
    MessagesChanged { channel_id: ChannelId },
    TypingChanged { channel_id: ChannelId },
    PresenceChanged,
    VoiceChanged,
    BannerChanged,
    LoggedOut(LogoutReason),
    Error(String),
}

pub(crate) enum Inbound {
    Stream { registration: u64, event: ServerEvent },
    StreamReconnected,
    Media(MediaEvent),
    TimerFired { key: TimerKey, generation: u64 },
}

/// Stream handler installed for one registration; events from a replaced
/// registration are dropped by the pump.
struct StreamForwarder {
    registration: u64,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl StreamEventHandler for StreamForwarder {
    fn on_event(&self, event: ServerEvent) {
        let _ = self.inbound.send(Inbound::Stream {
            registration: self.registration,
            event,
        });
    }
}

struct ReconnectForwarder {
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl ReconnectHandler for ReconnectForwarder {
    fn on_reconnected(&self) {
        let _ = self.inbound.send(Inbound::StreamReconnected);
    }
}

pub struct SessionEngine {
    settings: ClientSettings,
    data: Arc<dyn DataFetchClient>,
    transport: Arc<dyn StreamTransport>,
    media: Arc<dyn MediaSession>,
    navigator: Arc<dyn SessionNavigator>,
    scroll: Arc<dyn ScrollPreserver>,
    inner: Mutex<SessionContext>,
    inbound: mpsc::UnboundedSender<Inbound>,
    events: broadcast::Sender<ClientEvent>,
}

impl SessionEngine {
    /// Builds the engine and starts its inbound pump. Must be called inside a
    /// tokio runtime.
    pub fn new(settings: ClientSettings, collaborators: Collaborators) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let Collaborators {
            data,
            transport,
            media,
            navigator,
            scroll,
        } = collaborators;

        transport.set_reconnect_handler(Arc::new(ReconnectForwarder {
            inbound: inbound.clone(),
        }));
        spawn_media_forwarder(media.subscribe_events(), inbound.clone());

        let engine = Arc::new(Self {
            settings,
            data,
            transport,
            media,
            navigator,
            scroll,
            inner: Mutex::new(SessionContext::new()),
            inbound,
            events,
        });
        spawn_inbound_pump(Arc::downgrade(&engine), inbound_rx);
        engine
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        self.inner.lock().await.snapshot()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.lock().await.phase
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: impl IntoIterator<Item = ClientEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    fn set_phase(&self, ctx: &mut SessionContext, phase: SessionPhase) {
        if ctx.phase != phase {
            debug!(from = ?ctx.phase, to = ?phase, "session: phase change");
            ctx.phase = phase;
            self.emit(ClientEvent::PhaseChanged(phase));
        }
    }

    /// Raises a banner flag and (re)starts its single auto-clear timer.
    fn show_banner(&self, ctx: &mut SessionContext, banner: Banner) {
        let delay = match banner {
            Banner::SendError => self.settings.send_error_display,
            Banner::RateLimit => self.settings.rate_limit_banner,
        };
        *ctx.channel.banner_mut(banner) = true;
        self.schedule_timer(ctx, banner.timer_key(), delay);
        self.emit(ClientEvent::BannerChanged);
    }

    fn schedule_timer(
        &self,
        ctx: &mut SessionContext,
        key: TimerKey,
        delay: std::time::Duration,
    ) {
        let inbound = self.inbound.clone();
        ctx.timers.schedule(key, delay, move |key, generation| {
            let _ = inbound.send(Inbound::TimerFired { key, generation });
        });
    }

    async fn expire_timer(&self, key: TimerKey, generation: u64) {
        let mut guard = self.inner.lock().await;
        if !guard.timers.complete(key, generation) {
            debug!(?key, generation, "timers: ignoring superseded expiry");
            return;
        }
        match key {
            TimerKey::Typing(user_id) => {
                if guard.typing.remove(&user_id).is_some() {
                    if let Some(channel_id) = guard.channel.channel_id {
                        self.emit(ClientEvent::TypingChanged { channel_id });
                    }
                }
            }
            TimerKey::SendError => {
                guard.channel.send_error = false;
                self.emit(ClientEvent::BannerChanged);
            }
            TimerKey::RateLimit => {
                guard.channel.rate_limited = false;
                self.emit(ClientEvent::BannerChanged);
            }
        }
    }

    /// Issues a fresh registration id and installs a forwarder for it.
    fn attach_stream_handler(&self, ctx: &mut SessionContext) {
        self.detach_stream_handler(ctx);
        ctx.next_registration += 1;
        let registration = ctx.next_registration;
        ctx.handler_registration = Some(registration);
        self.transport.set_event_handler(Arc::new(StreamForwarder {
            registration,
            inbound: self.inbound.clone(),
        }));
    }

    /// No-op when nothing is registered.
    fn detach_stream_handler(&self, ctx: &mut SessionContext) {
        if let Some(registration) = ctx.handler_registration.take() {
            debug!(registration, "session: detaching stream handler");
            self.transport.clear_event_handler();
        }
    }

    /// Fatal session end: tears everything down and hands control to the navigator.
    fn force_logout(self: &Arc<Self>, ctx: &mut SessionContext, reason: LogoutReason) {
        warn!(?reason, "session: forced logout");
        self.detach_stream_handler(ctx);
        ctx.reset(ResetScope::Full);
        self.set_phase(ctx, SessionPhase::Disconnected);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = engine.transport.disconnect().await {
                debug!("session: transport disconnect after logout failed: {err}");
            }
            if let Err(err) = engine.media.leave().await {
                debug!("session: media leave after logout failed: {err}");
            }
        });

        self.navigator.force_logout(reason);
        self.emit(ClientEvent::LoggedOut(reason));
    }

    async fn handle_inbound(self: &Arc<Self>, inbound: Inbound) {
        match inbound {
            Inbound::Stream {
                registration,
                event,
            } => self.dispatch_from(registration, event).await,
            Inbound::StreamReconnected => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = engine.reconnect().await {
                        warn!("session: reconnect failed: {err}");
                    }
                });
            }
            Inbound::Media(event) => self.apply_media_event(event).await,
            Inbound::TimerFired { key, generation } => self.expire_timer(key, generation).await,
        }
    }
}

fn spawn_inbound_pump(
    engine: std::sync::Weak<SessionEngine>,
    mut inbound_rx: mpsc::UnboundedReceiver<Inbound>,
) {
    tokio::spawn(async move {
        while let Some(inbound) = inbound_rx.recv().await {
            let Some(engine) = engine.upgrade() else {
                break;
            };
            engine.handle_inbound(inbound).await;
        }
    });
}

fn spawn_media_forwarder(
    mut events: broadcast::Receiver<MediaEvent>,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if inbound.send(Inbound::Media(event)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "voice: media event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(test)]
#[path = "tests/mod.rs"]
mod tests;
