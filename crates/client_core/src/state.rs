//! Session-scoped state shared by every reconciler.
//!
//! One [`SessionContext`] exists per engine. It is only touched while the
//! engine lock is held, and every inbound event is applied in a single
//! critical section, so observers never see half of an event.

use std::collections::{BTreeMap, HashMap, HashSet};

use media_session::{LocalMediaState, MediaToggle};
use shared::{
    domain::{ChannelId, ChannelKind, MessageId, ProducerId, ProducerLabel, Role, UserId},
    protocol::{
        BootstrapSnapshot, ChannelSummary, MessagePayload, ServerInfo, UserSummary,
        VoiceParticipantPayload,
    },
};
use tokio::time::Instant;

use crate::timers::TimerManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    SnapshotLoaded,
    StreamAttached,
    Ready,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Typing(UserId),
    SendError,
    RateLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Banner {
    SendError,
    RateLimit,
}

impl Banner {
    pub(crate) fn timer_key(self) -> TimerKey {
        match self {
            Banner::SendError => TimerKey::SendError,
            Banner::RateLimit => TimerKey::RateLimit,
        }
    }
}

/// The selected channel and everything scoped to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelSession {
    pub channel_id: Option<ChannelId>,
    pub channel_name: Option<String>,
    pub messages: Vec<MessagePayload>,
    pub has_more: bool,
    pub loading_more: bool,
    pub reply_to: Option<MessageId>,
    pub editing: Option<MessageId>,
    pub send_error: bool,
    pub rate_limited: bool,
    /// Bumped on every selection; fetch completions compare against it.
    pub(crate) epoch: u64,
}

impl ChannelSession {
    pub(crate) fn reset_for(&mut self, channel_id: ChannelId, name: String) {
        let epoch = self.epoch + 1;
        *self = ChannelSession {
            channel_id: Some(channel_id),
            channel_name: Some(name),
            epoch,
            ..ChannelSession::default()
        };
    }

    pub(crate) fn is_selected(&self, channel_id: ChannelId) -> bool {
        self.channel_id == Some(channel_id)
    }

    pub(crate) fn banner_mut(&mut self, banner: Banner) -> &mut bool {
        match banner {
            Banner::SendError => &mut self.send_error,
            Banner::RateLimit => &mut self.rate_limited,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSet {
    pub online: BTreeMap<UserId, UserSummary>,
    pub avatars: HashMap<UserId, String>,
    pub roles: HashMap<UserId, Role>,
}

/// Which remote stream a watch target refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    Screen,
    Camera,
}

impl WatchKind {
    pub fn label(self) -> ProducerLabel {
        match self {
            WatchKind::Screen => ProducerLabel::Screen,
            WatchKind::Camera => ProducerLabel::Camera,
        }
    }

    pub fn for_label(label: ProducerLabel) -> Option<Self> {
        match label {
            ProducerLabel::Screen => Some(WatchKind::Screen),
            ProducerLabel::Camera => Some(WatchKind::Camera),
            _ => None,
        }
    }

    pub(crate) fn target(self, voice: &VoiceState) -> Option<UserId> {
        match self {
            WatchKind::Screen => voice.screen_watch,
            WatchKind::Camera => voice.camera_watch,
        }
    }

    pub(crate) fn target_mut(self, voice: &mut VoiceState) -> &mut Option<UserId> {
        match self {
            WatchKind::Screen => &mut voice.screen_watch,
            WatchKind::Camera => &mut voice.camera_watch,
        }
    }

    pub(crate) fn sharing_mut(self, participant: &mut VoiceParticipantPayload) -> &mut bool {
        match self {
            WatchKind::Screen => &mut participant.screen_sharing,
            WatchKind::Camera => &mut participant.camera_sharing,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceState {
    pub participants: BTreeMap<(UserId, ChannelId), VoiceParticipantPayload>,
    pub speaking: HashSet<UserId>,
    pub local_channel: Option<ChannelId>,
    pub local: LocalMediaState,
    pub screen_watch: Option<UserId>,
    pub camera_watch: Option<UserId>,
    pub consumed: HashMap<ProducerId, (UserId, ProducerLabel)>,
    pub remote_tracks: HashMap<(UserId, ProducerLabel), String>,
    pub(crate) toggles_in_flight: HashSet<MediaToggle>,
}

impl VoiceState {
    pub fn participants_in(&self, channel_id: ChannelId) -> Vec<&VoiceParticipantPayload> {
        self.participants
            .values()
            .filter(|participant| participant.channel_id == channel_id)
            .collect()
    }

    pub(crate) fn forget_consumed(&mut self, user_id: UserId, label: Option<ProducerLabel>) {
        self.consumed.retain(|_, (owner, consumed_label)| {
            *owner != user_id || label.is_some_and(|label| label != *consumed_label)
        });
    }

    /// Drops the participant roster learned from the server. The local media
    /// session survives a stream reconnect, so its watch targets, consumers
    /// and tracks are kept and a producer is still consumed only once.
    pub(crate) fn clear_remote(&mut self) {
        self.participants.clear();
        self.speaking.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResetScope {
    /// Reconnect: the local media session is still live.
    Reconnect,
    Full,
}

pub struct SessionContext {
    pub(crate) phase: SessionPhase,
    pub(crate) connecting: bool,
    pub(crate) handler_registration: Option<u64>,
    pub(crate) next_registration: u64,
    pub(crate) me: Option<UserSummary>,
    pub(crate) server: ServerInfo,
    pub(crate) channels: Vec<ChannelSummary>,
    pub(crate) channel: ChannelSession,
    pub(crate) typing: BTreeMap<UserId, TypingEntry>,
    pub(crate) presence: PresenceSet,
    pub(crate) voice: VoiceState,
    pub(crate) timers: TimerManager<TimerKey>,
    pub(crate) last_typing_sent: Option<Instant>,
}

impl SessionContext {
    pub(crate) fn new() -> Self {
        Self {
            phase: SessionPhase::Disconnected,
            connecting: false,
            handler_registration: None,
            next_registration: 0,
            me: None,
            server: ServerInfo::default(),
            channels: Vec::new(),
            channel: ChannelSession::default(),
            typing: BTreeMap::new(),
            presence: PresenceSet::default(),
            voice: VoiceState::default(),
            timers: TimerManager::new(),
            last_typing_sent: None,
        }
    }

    pub(crate) fn local_user_id(&self) -> Option<UserId> {
        self.me.as_ref().map(|me| me.user_id)
    }

    pub(crate) fn is_local(&self, user_id: UserId) -> bool {
        self.local_user_id() == Some(user_id)
    }

    /// Clears all reconciler state and cancels every transient timer.
    /// The selection epoch only moves forward so late completions stay stale.
    pub(crate) fn reset(&mut self, scope: ResetScope) {
        self.timers.cancel_all();
        let epoch = self.channel.epoch + 1;
        self.me = None;
        self.server = ServerInfo::default();
        self.channels.clear();
        self.channel = ChannelSession {
            epoch,
            ..ChannelSession::default()
        };
        self.typing.clear();
        self.presence = PresenceSet::default();
        match scope {
            ResetScope::Reconnect => self.voice.clear_remote(),
            ResetScope::Full => self.voice = VoiceState::default(),
        }
        self.last_typing_sent = None;
    }

    pub(crate) fn apply_bootstrap(&mut self, snapshot: BootstrapSnapshot) {
        let BootstrapSnapshot {
            me,
            server,
            mut channels,
            online_users,
            voice_states,
        } = snapshot;

        channels.sort_by_key(|channel| (channel.position, channel.channel_id));
        self.presence.roles.insert(me.user_id, me.role);
        self.me = Some(me);
        self.server = server;
        self.channels = channels;
        for user in online_users {
            if let Some(url) = &user.avatar_url {
                self.presence.avatars.insert(user.user_id, url.clone());
            }
            self.presence.roles.insert(user.user_id, user.role);
            self.presence.online.insert(user.user_id, user);
        }
        for participant in voice_states {
            self.voice
                .participants
                .retain(|(user_id, _), _| *user_id != participant.user_id);
            self.voice
                .participants
                .insert((participant.user_id, participant.channel_id), participant);
        }
    }

    /// The requested channel if it is a known text channel, else the first text channel.
    pub(crate) fn default_text_channel(
        &self,
        requested: Option<ChannelId>,
    ) -> Option<(ChannelId, String)> {
        let text_channels = || {
            self.channels
                .iter()
                .filter(|channel| channel.kind == ChannelKind::Text)
        };
        requested
            .and_then(|id| text_channels().find(|channel| channel.channel_id == id))
            .or_else(|| text_channels().next())
            .map(|channel| (channel.channel_id, channel.name.clone()))
    }

    pub(crate) fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            phase: self.phase,
            me: self.me.clone(),
            server: self.server.clone(),
            channels: self.channels.clone(),
            channel: self.channel.clone(),
            typing: self
                .typing
                .iter()
                .map(|(user_id, entry)| (*user_id, entry.display_name.clone()))
                .collect(),
            active_timers: self.timers.active_count(),
            presence: self.presence.clone(),
            voice: self.voice.clone(),
        }
    }
}

/// Consistent copy of the engine state for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSnapshot {
    pub phase: SessionPhase,
    pub me: Option<UserSummary>,
    pub server: ServerInfo,
    pub channels: Vec<ChannelSummary>,
    pub channel: ChannelSession,
    pub typing: Vec<(UserId, String)>,
    pub active_timers: usize,
    pub presence: PresenceSet,
    pub voice: VoiceState,
}

impl EngineSnapshot {
    pub fn message_ids(&self) -> Vec<MessageId> {
        self.channel
            .messages
            .iter()
            .map(|message| message.message_id)
            .collect()
    }
}

pub(crate) fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        1.0
    } else {
        volume.clamp(0.0, 2.0)
    }
}
