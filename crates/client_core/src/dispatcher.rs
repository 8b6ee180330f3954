//! Routes every inbound stream event to its reconciler.
//!
//! State for one event is applied under a single lock; collaborator calls the
//! event implies are collected as [`Deferred`] work and run after the lock is
//! released.

use std::sync::Arc;

use media_session::SoundCue;
use shared::{
    domain::{ChannelId, UserId},
    protocol::{ProducerSummary, ServerEvent},
};
use tracing::{debug, info, warn};

use crate::{
    presence::{NameUpdate, PresenceChange},
    state::{Banner, SessionContext, TimerKey, WatchKind},
    ClientEvent, LogoutReason, SessionEngine,
};

/// Side effects that must not run under the engine lock.
#[derive(Debug)]
pub(crate) enum Deferred {
    Refetch { channel_id: ChannelId, epoch: u64 },
    ReselectDefault,
    Consume(ProducerSummary),
    PlayCue(SoundCue),
    RemoveAudio(UserId),
}

impl SessionEngine {
    /// Applies an event regardless of which handler delivered it.
    #[cfg(test)]
    pub(crate) async fn dispatch(self: &Arc<Self>, event: ServerEvent) {
        self.dispatch_checked(None, event).await;
    }

    /// Applies an event delivered by stream handler `registration`, unless
    /// that handler has been replaced. The check shares the apply's lock so
    /// a concurrent reset cannot slip in between.
    pub(crate) async fn dispatch_from(self: &Arc<Self>, registration: u64, event: ServerEvent) {
        self.dispatch_checked(Some(registration), event).await;
    }

    async fn dispatch_checked(self: &Arc<Self>, registration: Option<u64>, event: ServerEvent) {
        let deferred = {
            let mut guard = self.inner.lock().await;
            if let Some(registration) = registration {
                if guard.handler_registration != Some(registration) {
                    debug!(
                        registration,
                        current = ?guard.handler_registration,
                        "session: dropping event from replaced stream handler"
                    );
                    return;
                }
            }
            self.apply_event(&mut guard, event)
        };
        self.run_deferred(deferred);
    }

    fn apply_event(self: &Arc<Self>, ctx: &mut SessionContext, event: ServerEvent) -> Vec<Deferred> {
        let mut deferred = Vec::new();
        match event {
            ServerEvent::MessageCreated { message } => {
                let (channel_id, author_id) = (message.channel_id, message.author_id);
                if !ctx.channel.is_selected(channel_id) {
                    return deferred;
                }
                if ctx.typing.remove(&author_id).is_some() {
                    ctx.timers.cancel(&TimerKey::Typing(author_id));
                    self.emit(ClientEvent::TypingChanged { channel_id });
                }
                ctx.channel.apply_created(message);
                self.emit(ClientEvent::MessagesChanged { channel_id });
            }
            ServerEvent::MessageEdited {
                channel_id,
                message_id,
                content,
                edited_at,
            } => {
                if ctx.channel.is_selected(channel_id)
                    && ctx.channel.apply_edited(message_id, content, edited_at)
                {
                    self.emit(ClientEvent::MessagesChanged { channel_id });
                }
            }
            ServerEvent::MessageDeleted {
                channel_id,
                message_id,
            } => {
                if ctx.channel.is_selected(channel_id) && ctx.channel.apply_deleted(message_id) {
                    self.emit(ClientEvent::MessagesChanged { channel_id });
                }
            }
            ServerEvent::ReactionAdded {
                channel_id,
                message_id,
                emoji,
                user_id,
                username,
            } => self.apply_reaction_event(ctx, channel_id, message_id, &emoji, user_id, &username, true),
            ServerEvent::ReactionRemoved {
                channel_id,
                message_id,
                emoji,
                user_id,
                username,
            } => self.apply_reaction_event(ctx, channel_id, message_id, &emoji, user_id, &username, false),
            ServerEvent::LinkPreviewReady {
                channel_id,
                message_id,
                previews,
            } => {
                if ctx.channel.is_selected(channel_id)
                    && ctx.channel.apply_link_previews(message_id, previews)
                {
                    self.emit(ClientEvent::MessagesChanged { channel_id });
                }
            }
            ServerEvent::ChannelCreated { channel } | ServerEvent::ChannelUpdated { channel } => {
                ctx.upsert_channel(channel);
                self.emit(ClientEvent::ChannelsChanged);
            }
            ServerEvent::ChannelDeleted { channel_id } => {
                if ctx.remove_channel(channel_id) {
                    self.emit(ClientEvent::ChannelsChanged);
                }
                if ctx.channel.is_selected(channel_id) {
                    info!(channel_id = channel_id.0, "messages: selected channel was deleted");
                    deferred.push(Deferred::ReselectDefault);
                }
            }
            ServerEvent::UserOnline { user } => {
                self.apply_presence_change(ctx, PresenceChange::Online(user))
            }
            ServerEvent::UserOffline { user_id } => {
                self.apply_presence_change(ctx, PresenceChange::Offline(user_id))
            }
            ServerEvent::UserAvatarUpdated {
                user_id,
                avatar_token,
                removed,
            } => self.apply_avatar_update(ctx, user_id, avatar_token, removed),
            ServerEvent::UserProfileUpdated {
                user_id,
                username,
                display_name,
            } => self.apply_name_update(
                ctx,
                user_id,
                NameUpdate {
                    username,
                    display_name: Some(display_name),
                },
            ),
            ServerEvent::UserRenamed { user_id, username } => self.apply_name_update(
                ctx,
                user_id,
                NameUpdate {
                    username,
                    display_name: None,
                },
            ),
            ServerEvent::UserRoleChanged { user_id, role } => {
                self.apply_role_change(ctx, user_id, role)
            }
            ServerEvent::UserKicked { user_id } => {
                self.apply_moderation(ctx, user_id, LogoutReason::Kicked)
            }
            ServerEvent::UserBanned { user_id } => {
                self.apply_moderation(ctx, user_id, LogoutReason::Banned)
            }
            ServerEvent::Typing {
                channel_id,
                user_id,
                display_name,
            } => self.note_typing(ctx, channel_id, user_id, display_name),
            ServerEvent::Error(error) => {
                if error.is_rate_limited() {
                    debug!(retry_after_ms = ?error.retry_after_ms, "messages: rate limited");
                    self.show_banner(ctx, Banner::RateLimit);
                } else if error.is_unauthorized() {
                    self.force_logout(ctx, LogoutReason::AuthExpired);
                } else {
                    warn!("session: server reported error: {error}");
                    self.emit(ClientEvent::Error(error.to_string()));
                }
            }
            ServerEvent::VoiceUserJoined { participant } => {
                self.apply_voice_joined(ctx, participant, &mut deferred)
            }
            ServerEvent::VoiceUserLeft {
                channel_id,
                user_id,
            } => self.apply_voice_left(ctx, channel_id, user_id, &mut deferred),
            ServerEvent::VoiceStateUpdated { participant } => {
                self.apply_voice_state(ctx, participant)
            }
            ServerEvent::VoiceSpeaking {
                user_id, speaking, ..
            } => self.apply_speaking(ctx, user_id, speaking),
            ServerEvent::VoiceNewProducer {
                channel_id,
                user_id,
                producer_id,
                label,
            } => self.apply_new_producer(
                ctx,
                channel_id,
                ProducerSummary {
                    producer_id,
                    user_id,
                    label,
                },
                &mut deferred,
            ),
            ServerEvent::ScreenShareUpdated {
                channel_id,
                user_id,
                active,
            } => self.apply_share_update(ctx, WatchKind::Screen, channel_id, user_id, active),
            ServerEvent::CameraUpdated {
                channel_id,
                user_id,
                active,
            } => self.apply_share_update(ctx, WatchKind::Camera, channel_id, user_id, active),
            ServerEvent::SyncRequired { channel_id } => {
                match (channel_id, ctx.channel.channel_id) {
                    (Some(requested), Some(selected)) if requested != selected => {
                        debug!(channel_id = requested.0, "messages: sync for unselected channel ignored")
                    }
                    (_, Some(selected)) => deferred.push(Deferred::Refetch {
                        channel_id: selected,
                        epoch: ctx.channel.epoch,
                    }),
                    (_, None) => {}
                }
            }
        }
        deferred
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_reaction_event(
        &self,
        ctx: &mut SessionContext,
        channel_id: ChannelId,
        message_id: shared::domain::MessageId,
        emoji: &str,
        user_id: UserId,
        username: &str,
        added: bool,
    ) {
        if !ctx.channel.is_selected(channel_id) {
            return;
        }
        let by_me = ctx.is_local(user_id);
        if ctx
            .channel
            .apply_reaction(message_id, emoji, username, added, by_me)
        {
            self.emit(ClientEvent::MessagesChanged { channel_id });
        }
    }

    /// Moderation against the local identity ends the session at once.
    fn apply_moderation(self: &Arc<Self>, ctx: &mut SessionContext, user_id: UserId, reason: LogoutReason) {
        if ctx.is_local(user_id) {
            self.force_logout(ctx, reason);
        } else {
            debug!(user_id = user_id.0, ?reason, "presence: moderation of another user");
        }
    }

    fn run_deferred(self: &Arc<Self>, deferred: Vec<Deferred>) {
        for work in deferred {
            match work {
                Deferred::Refetch { channel_id, epoch } => {
                    let engine = Arc::clone(self);
                    tokio::spawn(async move { engine.fetch_latest(channel_id, epoch).await });
                }
                Deferred::ReselectDefault => {
                    let engine = Arc::clone(self);
                    tokio::spawn(async move { engine.select_default_channel().await });
                }
                Deferred::Consume(producer) => {
                    let engine = Arc::clone(self);
                    tokio::spawn(async move { engine.consume_producer(producer).await });
                }
                Deferred::PlayCue(cue) => self.media.play_cue(cue),
                Deferred::RemoveAudio(user_id) => self.media.remove_remote_audio(user_id),
            }
        }
    }
}
