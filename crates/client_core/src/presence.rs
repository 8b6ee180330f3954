//! Global (not channel-scoped) membership events.

use shared::{
    domain::{Role, UserId},
    protocol::UserSummary,
};
use tracing::{debug, info};

use crate::{state::SessionContext, ClientEvent, SessionEngine};

/// One side of an online/offline transition.
pub(crate) enum PresenceChange {
    Online(UserSummary),
    Offline(UserId),
}

/// Name fields to propagate. `display_name` is `None` when the event does not
/// carry one and the current value must be left untouched.
pub(crate) struct NameUpdate {
    pub(crate) username: String,
    pub(crate) display_name: Option<Option<String>>,
}

impl SessionEngine {
    pub(crate) fn apply_presence_change(&self, ctx: &mut SessionContext, change: PresenceChange) {
        match change {
            PresenceChange::Online(mut user) => {
                debug!(user_id = user.user_id.0, "presence: user online");
                match &user.avatar_url {
                    Some(url) => {
                        ctx.presence.avatars.insert(user.user_id, url.clone());
                    }
                    None => user.avatar_url = ctx.presence.avatars.get(&user.user_id).cloned(),
                }
                ctx.presence.roles.insert(user.user_id, user.role);
                ctx.presence.online.insert(user.user_id, user);
            }
            PresenceChange::Offline(user_id) => {
                debug!(user_id = user_id.0, "presence: user offline");
                if ctx.presence.online.remove(&user_id).is_none() {
                    return;
                }
            }
        }
        self.emit(ClientEvent::PresenceChanged);
    }

    /// Points the avatar cache at a fresh url, or drops it when removed.
    pub(crate) fn apply_avatar_update(
        &self,
        ctx: &mut SessionContext,
        user_id: UserId,
        token: Option<String>,
        removed: bool,
    ) {
        let url = if removed {
            ctx.presence.avatars.remove(&user_id);
            None
        } else {
            let token = token.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
            let url = format!("{}?v={token}", self.data.avatar_url(user_id));
            ctx.presence.avatars.insert(user_id, url.clone());
            Some(url)
        };
        if let Some(user) = ctx.presence.online.get_mut(&user_id) {
            user.avatar_url = url.clone();
        }
        if let Some(me) = ctx.me.as_mut().filter(|me| me.user_id == user_id) {
            me.avatar_url = url;
        }
        self.emit(ClientEvent::PresenceChanged);
    }

    /// Fans a name change out to presence, voice participants and the authors
    /// of loaded messages.
    pub(crate) fn apply_name_update(
        &self,
        ctx: &mut SessionContext,
        user_id: UserId,
        update: NameUpdate,
    ) {
        info!(user_id = user_id.0, username = %update.username, "presence: name updated");
        let apply_to_user = |user: &mut UserSummary| {
            user.username = update.username.clone();
            if let Some(display_name) = &update.display_name {
                user.display_name = display_name.clone();
            }
        };
        if let Some(user) = ctx.presence.online.get_mut(&user_id) {
            apply_to_user(user);
        }
        if let Some(me) = ctx.me.as_mut().filter(|me| me.user_id == user_id) {
            apply_to_user(me);
        }

        let mut voice_touched = false;
        for participant in ctx
            .voice
            .participants
            .values_mut()
            .filter(|participant| participant.user_id == user_id)
        {
            participant.username = update.username.clone();
            voice_touched = true;
        }

        let mut messages_touched = false;
        for message in ctx
            .channel
            .messages
            .iter_mut()
            .filter(|message| message.author_id == user_id)
        {
            message.author_username = update.username.clone();
            if let Some(display_name) = &update.display_name {
                message.author_display_name = display_name.clone();
            }
            messages_touched = true;
        }

        self.emit(ClientEvent::PresenceChanged);
        if voice_touched {
            self.emit(ClientEvent::VoiceChanged);
        }
        if let (true, Some(channel_id)) = (messages_touched, ctx.channel.channel_id) {
            self.emit(ClientEvent::MessagesChanged { channel_id });
        }
    }

    pub(crate) fn apply_role_change(&self, ctx: &mut SessionContext, user_id: UserId, role: Role) {
        ctx.presence.roles.insert(user_id, role);
        if let Some(user) = ctx.presence.online.get_mut(&user_id) {
            user.role = role;
        }
        if let Some(me) = ctx.me.as_mut().filter(|me| me.user_id == user_id) {
            info!(?role, "presence: local role changed");
            me.role = role;
        }
        self.emit(ClientEvent::PresenceChanged);
    }
}
