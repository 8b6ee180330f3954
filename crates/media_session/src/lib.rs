//! Seam between the state engine and whatever SFU client captures, sends and
//! renders media. The engine only issues requests and listens for pushes.

use anyhow::anyhow;
use async_trait::async_trait;
use shared::{
    domain::{ChannelId, ProducerLabel, UserId, VoiceInputMode},
    protocol::{ProducerSummary, VoiceParticipantPayload},
};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaToggle {
    Mute,
    Deafen,
    ScreenShare,
    Camera,
}

impl MediaToggle {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaToggle::Mute => "mute",
            MediaToggle::Deafen => "deafen",
            MediaToggle::ScreenShare => "screen_share",
            MediaToggle::Camera => "camera",
        }
    }
}

/// The local identity's own media flags, as last reported by the media session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalMediaState {
    pub muted: bool,
    pub deafened: bool,
    pub screen_sharing: bool,
    pub camera_sharing: bool,
    pub input_mode: VoiceInputMode,
    pub push_to_talk_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundCue {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub user_id: UserId,
    pub label: ProducerLabel,
    pub track_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Full replacement of the participants of one channel.
    VoiceStates {
        channel_id: ChannelId,
        participants: Vec<VoiceParticipantPayload>,
    },
    Speaking {
        user_id: UserId,
        speaking: bool,
    },
    LocalState(LocalMediaState),
    RemoteTrack(RemoteTrack),
    /// The media transport came back; producers may need consuming again.
    Reconnected {
        channel_id: ChannelId,
    },
}

#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn join(&self, channel_id: ChannelId) -> anyhow::Result<()>;
    async fn leave(&self) -> anyhow::Result<()>;
    async fn toggle(&self, toggle: MediaToggle) -> anyhow::Result<LocalMediaState>;
    async fn user_volume(&self, user_id: UserId) -> anyhow::Result<f32>;
    async fn set_user_volume(&self, user_id: UserId, volume: f32) -> anyhow::Result<()>;
    async fn consume(&self, producer: ProducerSummary) -> anyhow::Result<()>;
    async fn list_producers(&self, channel_id: ChannelId) -> anyhow::Result<Vec<ProducerSummary>>;
    async fn close_consumer(&self, user_id: UserId, label: ProducerLabel) -> anyhow::Result<()>;
    fn remove_remote_audio(&self, user_id: UserId);
    fn play_cue(&self, cue: SoundCue);
    fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent>;
}

/// Stand-in for hosts built without a voice backend: every request fails and
/// nothing is ever pushed.
pub struct MissingMediaSession {
    events: broadcast::Sender<MediaEvent>,
}

impl MissingMediaSession {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for MissingMediaSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSession for MissingMediaSession {
    async fn join(&self, channel_id: ChannelId) -> anyhow::Result<()> {
        Err(anyhow!(
            "media session unavailable; cannot join channel {}",
            channel_id.0
        ))
    }

    async fn leave(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn toggle(&self, toggle: MediaToggle) -> anyhow::Result<LocalMediaState> {
        Err(anyhow!("media session unavailable; cannot toggle {}", toggle.as_str()))
    }

    async fn user_volume(&self, _user_id: UserId) -> anyhow::Result<f32> {
        Ok(1.0)
    }

    async fn set_user_volume(&self, _user_id: UserId, _volume: f32) -> anyhow::Result<()> {
        Err(anyhow!("media session unavailable"))
    }

    async fn consume(&self, producer: ProducerSummary) -> anyhow::Result<()> {
        Err(anyhow!(
            "media session unavailable; cannot consume producer {}",
            producer.producer_id.0
        ))
    }

    async fn list_producers(&self, _channel_id: ChannelId) -> anyhow::Result<Vec<ProducerSummary>> {
        Ok(Vec::new())
    }

    async fn close_consumer(&self, _user_id: UserId, _label: ProducerLabel) -> anyhow::Result<()> {
        Ok(())
    }

    fn remove_remote_audio(&self, _user_id: UserId) {}

    fn play_cue(&self, _cue: SoundCue) {}

    fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }
}
