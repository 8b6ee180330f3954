use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use media_session::{LocalMediaState, MediaEvent, MediaSession, MediaToggle, SoundCue};
use shared::{
    domain::{ChannelId, ChannelKind, FileId, MessageId, ProducerId, ProducerLabel, Role, UserId},
    protocol::{
        BootstrapSnapshot, ChannelSummary, MessagePayload, ProducerSummary, ServerEvent,
        ServerInfo, UserSummary, VoiceParticipantPayload,
    },
};
use tokio::sync::{broadcast, oneshot};

use crate::{
    error::ClientError, ClientSettings, Collaborators, DataFetchClient, EngineSnapshot,
    LogoutReason, ReconnectHandler, ScrollPreserver, SendAck, SessionEngine, SessionNavigator,
    StreamEventHandler, StreamTransport,
};

pub(crate) const ME: UserId = UserId(1);
pub(crate) const BOB: UserId = UserId(2);
pub(crate) const CAROL: UserId = UserId(3);
pub(crate) const GENERAL: ChannelId = ChannelId(10);
pub(crate) const RANDOM: ChannelId = ChannelId(11);
pub(crate) const LOUNGE: ChannelId = ChannelId(20);

pub(crate) fn user(user_id: UserId, username: &str) -> UserSummary {
    UserSummary {
        user_id,
        username: username.into(),
        display_name: None,
        avatar_url: None,
        role: Role::Member,
    }
}

pub(crate) fn channel(channel_id: ChannelId, kind: ChannelKind, name: &str, position: i32) -> ChannelSummary {
    ChannelSummary {
        channel_id,
        kind,
        name: name.into(),
        position,
    }
}

pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("timestamp")
}

pub(crate) fn message(id: i64, channel_id: ChannelId, author: UserId, secs: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        channel_id,
        author_id: author,
        author_username: format!("user{}", author.0),
        author_display_name: None,
        content: format!("message {id}"),
        sent_at: at(secs),
        edited_at: None,
        reply_to: None,
        attachments: Vec::new(),
        reactions: Vec::new(),
        link_previews: Vec::new(),
    }
}

/// `count` messages from bob with ids and timestamps `1..=count`.
pub(crate) fn history(channel_id: ChannelId, count: i64) -> Vec<MessagePayload> {
    (1..=count)
        .map(|id| message(id, channel_id, BOB, id))
        .collect()
}

pub(crate) fn participant(user_id: UserId, channel_id: ChannelId) -> VoiceParticipantPayload {
    VoiceParticipantPayload {
        user_id,
        channel_id,
        username: format!("user{}", user_id.0),
        muted: false,
        deafened: false,
        screen_sharing: false,
        camera_sharing: false,
    }
}

pub(crate) fn producer(id: &str, user_id: UserId, label: ProducerLabel) -> ProducerSummary {
    ProducerSummary {
        producer_id: ProducerId(id.into()),
        user_id,
        label,
    }
}

pub(crate) fn new_producer_event(channel_id: ChannelId, producer: &ProducerSummary) -> ServerEvent {
    ServerEvent::VoiceNewProducer {
        channel_id,
        user_id: producer.user_id,
        producer_id: producer.producer_id.clone(),
        label: producer.label,
    }
}

pub(crate) fn bootstrap_snapshot() -> BootstrapSnapshot {
    BootstrapSnapshot {
        me: user(ME, "alice"),
        server: ServerInfo {
            name: "test server".into(),
            ..ServerInfo::default()
        },
        channels: vec![
            channel(LOUNGE, ChannelKind::Voice, "lounge", 2),
            channel(GENERAL, ChannelKind::Text, "general", 0),
            channel(RANDOM, ChannelKind::Text, "random", 1),
        ],
        online_users: vec![user(ME, "alice"), user(BOB, "bob")],
        voice_states: Vec::new(),
    }
}

/// Lets spawned tasks and the inbound pump run to quiescence.
pub(crate) async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Gate {
    Bootstrap,
    History(ChannelId),
}

#[derive(Debug, Clone)]
pub(crate) enum Failure {
    AuthExpired,
    Network,
    Rejected(String),
}

impl Failure {
    fn into_error(self) -> anyhow::Error {
        match self {
            Failure::AuthExpired => ClientError::AuthExpired.into(),
            Failure::Network => anyhow!("connection reset by peer"),
            Failure::Rejected(reason) => ClientError::CommandRejected { reason }.into(),
        }
    }
}

/// Scripted data client. Gated calls park until [`FakeData::release`].
#[derive(Default)]
pub(crate) struct FakeData {
    bootstrap: Mutex<Option<BootstrapSnapshot>>,
    bootstrap_failure: Mutex<Option<Failure>>,
    history: Mutex<HashMap<ChannelId, Vec<MessagePayload>>>,
    fetch_failure: Mutex<Option<Failure>>,
    command_failure: Mutex<Option<Failure>>,
    gates: Mutex<Vec<Gate>>,
    held: Mutex<Vec<(Gate, oneshot::Sender<()>)>>,
    pub(crate) bootstrap_calls: AtomicUsize,
    pub(crate) fetch_calls: Mutex<Vec<(ChannelId, u32, Option<DateTime<Utc>>)>>,
    pub(crate) commands: Mutex<Vec<String>>,
}

impl FakeData {
    pub(crate) fn set_bootstrap(&self, snapshot: BootstrapSnapshot) {
        *self.bootstrap.lock().unwrap() = Some(snapshot);
    }

    pub(crate) fn fail_bootstrap(&self, failure: Option<Failure>) {
        *self.bootstrap_failure.lock().unwrap() = failure;
    }

    pub(crate) fn fail_fetches(&self, failure: Option<Failure>) {
        *self.fetch_failure.lock().unwrap() = failure;
    }

    pub(crate) fn fail_commands(&self, failure: Option<Failure>) {
        *self.command_failure.lock().unwrap() = failure;
    }

    pub(crate) fn set_history(&self, channel_id: ChannelId, messages: Vec<MessagePayload>) {
        self.history.lock().unwrap().insert(channel_id, messages);
    }

    pub(crate) fn push_history(&self, message: MessagePayload) {
        let mut history = self.history.lock().unwrap();
        let messages = history.entry(message.channel_id).or_default();
        messages.push(message);
        messages.sort_by_key(|message| message.sent_at);
    }

    /// Every later call through `gate` parks until released.
    pub(crate) fn gate(&self, gate: Gate) {
        self.gates.lock().unwrap().push(gate);
    }

    pub(crate) fn ungate(&self, gate: Gate) {
        self.gates.lock().unwrap().retain(|held| *held != gate);
    }

    pub(crate) fn held_count(&self, gate: Gate) -> usize {
        self.held
            .lock()
            .unwrap()
            .iter()
            .filter(|(held, _)| *held == gate)
            .count()
    }

    pub(crate) async fn wait_for_held(&self, gate: Gate) {
        for _ in 0..1000 {
            if self.held_count(gate) > 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("no call parked at {gate:?}");
    }

    /// Releases the oldest parked call for `gate`.
    pub(crate) fn release(&self, gate: Gate) {
        let mut held = self.held.lock().unwrap();
        let index = held
            .iter()
            .position(|(parked, _)| *parked == gate)
            .expect("parked call");
        let (_, release) = held.remove(index);
        let _ = release.send(());
    }

    async fn pass(&self, gate: Gate) {
        if !self.gates.lock().unwrap().contains(&gate) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        self.held.lock().unwrap().push((gate, tx));
        let _ = rx.await;
    }

    fn command(&self, text: String) -> Result<()> {
        self.commands.lock().unwrap().push(text);
        match self.command_failure.lock().unwrap().clone() {
            Some(failure) => Err(failure.into_error()),
            None => Ok(()),
        }
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataFetchClient for FakeData {
    async fn bootstrap(&self) -> Result<BootstrapSnapshot> {
        self.bootstrap_calls.fetch_add(1, Ordering::SeqCst);
        self.pass(Gate::Bootstrap).await;
        if let Some(failure) = self.bootstrap_failure.lock().unwrap().clone() {
            return Err(failure.into_error());
        }
        Ok(self
            .bootstrap
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(bootstrap_snapshot))
    }

    async fn list_channels(&self) -> Result<Vec<ChannelSummary>> {
        Ok(self
            .bootstrap
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(bootstrap_snapshot)
            .channels)
    }

    async fn fetch_messages(
        &self,
        channel_id: ChannelId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessagePayload>> {
        self.fetch_calls
            .lock()
            .unwrap()
            .push((channel_id, limit, before));
        self.pass(Gate::History(channel_id)).await;
        if let Some(failure) = self.fetch_failure.lock().unwrap().clone() {
            return Err(failure.into_error());
        }
        let eligible: Vec<MessagePayload> = self
            .history
            .lock()
            .unwrap()
            .get(&channel_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|message| before.map_or(true, |cursor| message.sent_at < cursor))
            .collect();
        let skip = eligible.len().saturating_sub(limit as usize);
        Ok(eligible.into_iter().skip(skip).collect())
    }

    async fn create_channel(&self, name: &str, kind: ChannelKind) -> Result<ChannelSummary> {
        self.command(format!("create_channel {name}"))?;
        Ok(channel(ChannelId(99), kind, name, 9))
    }

    async fn rename_channel(&self, channel_id: ChannelId, name: &str) -> Result<()> {
        self.command(format!("rename_channel {} {name}", channel_id.0))
    }

    async fn delete_channel(&self, channel_id: ChannelId) -> Result<()> {
        self.command(format!("delete_channel {}", channel_id.0))
    }

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> Result<()> {
        self.command(format!(
            "edit_message {} {} {content}",
            channel_id.0, message_id.0
        ))
    }

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> Result<()> {
        self.command(format!("delete_message {} {}", channel_id.0, message_id.0))
    }

    async fn add_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<()> {
        self.command(format!(
            "add_reaction {} {} {emoji}",
            channel_id.0, message_id.0
        ))
    }

    async fn remove_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<()> {
        self.command(format!(
            "remove_reaction {} {} {emoji}",
            channel_id.0, message_id.0
        ))
    }

    fn avatar_url(&self, user_id: UserId) -> String {
        format!("http://fake/users/{}/avatar", user_id.0)
    }
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    handler: Mutex<Option<Arc<dyn StreamEventHandler>>>,
    reconnect_handler: Mutex<Option<Arc<dyn ReconnectHandler>>>,
    acks: Mutex<VecDeque<std::result::Result<SendAck, Failure>>>,
    pub(crate) handler_sets: AtomicUsize,
    pub(crate) handler_clears: AtomicUsize,
    pub(crate) connects: AtomicUsize,
    pub(crate) disconnects: AtomicUsize,
    pub(crate) joined: Mutex<Vec<ChannelId>>,
    pub(crate) typing: Mutex<Vec<ChannelId>>,
    pub(crate) sent: Mutex<Vec<(ChannelId, String, Option<MessageId>)>>,
}

impl FakeTransport {
    pub(crate) fn handler(&self) -> Option<Arc<dyn StreamEventHandler>> {
        self.handler.lock().unwrap().clone()
    }

    /// Delivers an event the way the socket would.
    pub(crate) fn emit(&self, event: ServerEvent) {
        let handler = self.handler().expect("stream handler registered");
        handler.on_event(event);
    }

    pub(crate) fn fire_reconnect(&self) {
        let handler = self
            .reconnect_handler
            .lock()
            .unwrap()
            .clone()
            .expect("reconnect handler registered");
        handler.on_reconnected();
    }

    pub(crate) fn queue_ack(&self, ack: std::result::Result<SendAck, Failure>) {
        self.acks.lock().unwrap().push_back(ack);
    }

    pub(crate) fn joined(&self) -> Vec<ChannelId> {
        self.joined.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamTransport for FakeTransport {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn join_channel(&self, channel_id: ChannelId) -> Result<()> {
        self.joined.lock().unwrap().push(channel_id);
        Ok(())
    }

    async fn send_message(
        &self,
        channel_id: ChannelId,
        content: &str,
        _attachment_ids: &[FileId],
        reply_to: Option<MessageId>,
    ) -> Result<SendAck> {
        self.sent
            .lock()
            .unwrap()
            .push((channel_id, content.to_string(), reply_to));
        match self.acks.lock().unwrap().pop_front() {
            Some(Ok(ack)) => Ok(ack),
            Some(Err(failure)) => Err(failure.into_error()),
            None => Ok(SendAck::Accepted),
        }
    }

    fn send_typing(&self, channel_id: ChannelId) -> Result<()> {
        self.typing.lock().unwrap().push(channel_id);
        Ok(())
    }

    fn set_event_handler(&self, handler: Arc<dyn StreamEventHandler>) {
        self.handler_sets.fetch_add(1, Ordering::SeqCst);
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn clear_event_handler(&self) {
        self.handler_clears.fetch_add(1, Ordering::SeqCst);
        *self.handler.lock().unwrap() = None;
    }

    fn set_reconnect_handler(&self, handler: Arc<dyn ReconnectHandler>) {
        *self.reconnect_handler.lock().unwrap() = Some(handler);
    }
}

pub(crate) struct FakeMedia {
    events: broadcast::Sender<MediaEvent>,
    producers: Mutex<HashMap<ChannelId, Vec<ProducerSummary>>>,
    list_gate: Mutex<Option<oneshot::Receiver<()>>>,
    toggle_gate: Mutex<Option<oneshot::Receiver<()>>>,
    local: Mutex<LocalMediaState>,
    pub(crate) list_calls: AtomicUsize,
    pub(crate) consumed: Mutex<Vec<ProducerSummary>>,
    pub(crate) closed: Mutex<Vec<(UserId, ProducerLabel)>>,
    pub(crate) toggles: Mutex<Vec<MediaToggle>>,
    pub(crate) joins: Mutex<Vec<ChannelId>>,
    pub(crate) leaves: AtomicUsize,
    pub(crate) cues: Mutex<Vec<SoundCue>>,
    pub(crate) removed_audio: Mutex<Vec<UserId>>,
    pub(crate) volumes: Mutex<HashMap<UserId, f32>>,
}

impl Default for FakeMedia {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            producers: Mutex::default(),
            list_gate: Mutex::default(),
            toggle_gate: Mutex::default(),
            local: Mutex::default(),
            list_calls: AtomicUsize::new(0),
            consumed: Mutex::default(),
            closed: Mutex::default(),
            toggles: Mutex::default(),
            joins: Mutex::default(),
            leaves: AtomicUsize::new(0),
            cues: Mutex::default(),
            removed_audio: Mutex::default(),
            volumes: Mutex::default(),
        }
    }
}

impl FakeMedia {
    pub(crate) fn push(&self, event: MediaEvent) {
        self.events.send(event).expect("engine subscribed to media events");
    }

    pub(crate) fn set_producers(&self, channel_id: ChannelId, producers: Vec<ProducerSummary>) {
        self.producers.lock().unwrap().insert(channel_id, producers);
    }

    /// The next `list_producers` call parks until the returned sender fires.
    pub(crate) fn gate_list(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.list_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub(crate) fn gate_toggle(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.toggle_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub(crate) fn consumed_ids(&self) -> Vec<String> {
        self.consumed
            .lock()
            .unwrap()
            .iter()
            .map(|producer| producer.producer_id.0.clone())
            .collect()
    }

    pub(crate) fn cues(&self) -> Vec<SoundCue> {
        self.cues.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaSession for FakeMedia {
    async fn join(&self, channel_id: ChannelId) -> Result<()> {
        self.joins.lock().unwrap().push(channel_id);
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn toggle(&self, toggle: MediaToggle) -> Result<LocalMediaState> {
        self.toggles.lock().unwrap().push(toggle);
        let gate = self.toggle_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let mut local = self.local.lock().unwrap();
        match toggle {
            MediaToggle::Mute => local.muted = !local.muted,
            MediaToggle::Deafen => local.deafened = !local.deafened,
            MediaToggle::ScreenShare => local.screen_sharing = !local.screen_sharing,
            MediaToggle::Camera => local.camera_sharing = !local.camera_sharing,
        }
        Ok(*local)
    }

    async fn user_volume(&self, user_id: UserId) -> Result<f32> {
        Ok(self
            .volumes
            .lock()
            .unwrap()
            .get(&user_id)
            .copied()
            .unwrap_or(1.0))
    }

    async fn set_user_volume(&self, user_id: UserId, volume: f32) -> Result<()> {
        self.volumes.lock().unwrap().insert(user_id, volume);
        Ok(())
    }

    async fn consume(&self, producer: ProducerSummary) -> Result<()> {
        self.consumed.lock().unwrap().push(producer);
        Ok(())
    }

    async fn list_producers(&self, channel_id: ChannelId) -> Result<Vec<ProducerSummary>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.list_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(self
            .producers
            .lock()
            .unwrap()
            .get(&channel_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn close_consumer(&self, user_id: UserId, label: ProducerLabel) -> Result<()> {
        self.closed.lock().unwrap().push((user_id, label));
        Ok(())
    }

    fn remove_remote_audio(&self, user_id: UserId) {
        self.removed_audio.lock().unwrap().push(user_id);
    }

    fn play_cue(&self, cue: SoundCue) {
        self.cues.lock().unwrap().push(cue);
    }

    fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
pub(crate) struct FakeNavigator {
    pub(crate) requested: Mutex<Option<ChannelId>>,
    pub(crate) logouts: Mutex<Vec<LogoutReason>>,
}

impl FakeNavigator {
    pub(crate) fn logouts(&self) -> Vec<LogoutReason> {
        self.logouts.lock().unwrap().clone()
    }
}

impl SessionNavigator for FakeNavigator {
    fn requested_channel(&self) -> Option<ChannelId> {
        *self.requested.lock().unwrap()
    }

    fn force_logout(&self, reason: LogoutReason) {
        self.logouts.lock().unwrap().push(reason);
    }
}

#[derive(Default)]
pub(crate) struct RecordingScroll {
    pub(crate) calls: Mutex<Vec<&'static str>>,
}

impl ScrollPreserver for RecordingScroll {
    fn capture(&self) {
        self.calls.lock().unwrap().push("capture");
    }

    fn restore(&self) {
        self.calls.lock().unwrap().push("restore");
    }
}

pub(crate) struct Harness {
    pub(crate) engine: Arc<SessionEngine>,
    pub(crate) data: Arc<FakeData>,
    pub(crate) transport: Arc<FakeTransport>,
    pub(crate) media: Arc<FakeMedia>,
    pub(crate) navigator: Arc<FakeNavigator>,
    pub(crate) scroll: Arc<RecordingScroll>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let data = Arc::new(FakeData::default());
        let transport = Arc::new(FakeTransport::default());
        let media = Arc::new(FakeMedia::default());
        let navigator = Arc::new(FakeNavigator::default());
        let scroll = Arc::new(RecordingScroll::default());
        let engine = SessionEngine::new(
            ClientSettings::default(),
            Collaborators {
                data: data.clone(),
                transport: transport.clone(),
                media: media.clone(),
                navigator: navigator.clone(),
                scroll: scroll.clone(),
            },
        );
        Self {
            engine,
            data,
            transport,
            media,
            navigator,
            scroll,
        }
    }

    /// Connected with `general` selected and holding `count` messages of history.
    pub(crate) async fn connected_with_history(count: i64) -> Self {
        let harness = Self::new();
        harness.data.set_history(GENERAL, history(GENERAL, count));
        harness.engine.connect().await.expect("connect");
        harness
    }

    pub(crate) async fn connected() -> Self {
        Self::connected_with_history(3).await
    }

    pub(crate) async fn in_voice() -> Self {
        let harness = Self::connected().await;
        harness.engine.join_voice(LOUNGE).await.expect("join voice");
        harness
    }

    pub(crate) async fn snapshot(&self) -> EngineSnapshot {
        self.engine.snapshot().await
    }
}
