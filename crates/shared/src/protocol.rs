use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ChannelId, ChannelKind, FileId, MessageId, ProducerId, ProducerLabel, Role, UserId,
    },
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel_id: ChannelId,
    pub kind: ChannelKind,
    pub name: String,
    #[serde(default)]
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub role: Role,
}

impl UserSummary {
    pub fn shown_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: u32,
    #[serde(default)]
    pub reacted_by_me: bool,
    #[serde(default)]
    pub reactor_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPreview {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub file_id: FileId,
    pub filename: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub author_username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_display_name: Option<String>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
    #[serde(default)]
    pub reactions: Vec<ReactionSummary>,
    #[serde(default)]
    pub link_previews: Vec<LinkPreview>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceParticipantPayload {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub username: String,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub deafened: bool,
    #[serde(default)]
    pub screen_sharing: bool,
    #[serde(default)]
    pub camera_sharing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomEmoji {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoundSummary {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub emojis: Vec<CustomEmoji>,
    #[serde(default)]
    pub sounds: Vec<SoundSummary>,
}

/// Point-in-time view returned by the bootstrap endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapSnapshot {
    pub me: UserSummary,
    #[serde(default)]
    pub server: ServerInfo,
    pub channels: Vec<ChannelSummary>,
    #[serde(default)]
    pub online_users: Vec<UserSummary>,
    #[serde(default)]
    pub voice_states: Vec<VoiceParticipantPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerSummary {
    pub producer_id: ProducerId,
    pub user_id: UserId,
    pub label: ProducerLabel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinChannel {
        channel_id: ChannelId,
    },
    SendMessage {
        request_id: String,
        channel_id: ChannelId,
        content: String,
        #[serde(default)]
        attachment_ids: Vec<FileId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
    },
    Typing {
        channel_id: ChannelId,
    },
}

/// Everything the server pushes over the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Event(ServerEvent),
    Ack {
        request_id: String,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageCreated {
        message: MessagePayload,
    },
    MessageEdited {
        channel_id: ChannelId,
        message_id: MessageId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        edited_at: Option<DateTime<Utc>>,
    },
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    ReactionAdded {
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: String,
        user_id: UserId,
        username: String,
    },
    ReactionRemoved {
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: String,
        user_id: UserId,
        username: String,
    },
    LinkPreviewReady {
        channel_id: ChannelId,
        message_id: MessageId,
        previews: Vec<LinkPreview>,
    },
    ChannelCreated {
        channel: ChannelSummary,
    },
    ChannelUpdated {
        channel: ChannelSummary,
    },
    ChannelDeleted {
        channel_id: ChannelId,
    },
    UserOnline {
        user: UserSummary,
    },
    UserOffline {
        user_id: UserId,
    },
    UserAvatarUpdated {
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar_token: Option<String>,
        #[serde(default)]
        removed: bool,
    },
    UserProfileUpdated {
        user_id: UserId,
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    UserRenamed {
        user_id: UserId,
        username: String,
    },
    UserRoleChanged {
        user_id: UserId,
        role: Role,
    },
    UserKicked {
        user_id: UserId,
    },
    UserBanned {
        user_id: UserId,
    },
    Typing {
        channel_id: ChannelId,
        user_id: UserId,
        display_name: String,
    },
    Error(ApiError),
    VoiceUserJoined {
        participant: VoiceParticipantPayload,
    },
    VoiceUserLeft {
        channel_id: ChannelId,
        user_id: UserId,
    },
    VoiceStateUpdated {
        participant: VoiceParticipantPayload,
    },
    VoiceSpeaking {
        channel_id: ChannelId,
        user_id: UserId,
        speaking: bool,
    },
    VoiceNewProducer {
        channel_id: ChannelId,
        user_id: UserId,
        producer_id: ProducerId,
        label: ProducerLabel,
    },
    ScreenShareUpdated {
        channel_id: ChannelId,
        user_id: UserId,
        active: bool,
    },
    CameraUpdated {
        channel_id: ChannelId,
        user_id: UserId,
        active: bool,
    },
    SyncRequired {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel_id: Option<ChannelId>,
    },
}
