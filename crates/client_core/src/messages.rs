use std::{collections::HashSet, sync::Arc};

use shared::{
    domain::{ChannelId, ChannelKind, FileId, MessageId, UserId},
    protocol::{ChannelSummary, LinkPreview, MessagePayload, ReactionSummary},
};
use tracing::{debug, info, warn};

use crate::{
    error::ClientError,
    state::{Banner, ChannelSession, SessionContext, TimerKey},
    ClientEvent, SendAck, SessionEngine,
};

/// Merges an authoritative page with what is already held locally.
///
/// The fetched page wins for ids present in both; local entries the page does
/// not know about (stream arrivals while the fetch was in flight, or older
/// pages) are kept. The result is deduplicated by id and ascending by
/// `(sent_at, message_id)`.
pub fn merge_page(fetched: Vec<MessagePayload>, local: &[MessagePayload]) -> Vec<MessagePayload> {
    let mut seen = HashSet::with_capacity(fetched.len() + local.len());
    let mut merged = Vec::with_capacity(fetched.len() + local.len());
    for message in fetched.into_iter().chain(local.iter().cloned()) {
        if seen.insert(message.message_id) {
            merged.push(message);
        }
    }
    merged.sort_by_key(|message| (message.sent_at, message.message_id));
    merged
}

impl ChannelSession {
    fn message_mut(&mut self, message_id: MessageId) -> Option<&mut MessagePayload> {
        self.messages
            .iter_mut()
            .find(|message| message.message_id == message_id)
    }

    pub(crate) fn message(&self, message_id: MessageId) -> Option<&MessagePayload> {
        self.messages
            .iter()
            .find(|message| message.message_id == message_id)
    }

    /// Inserts in timestamp order. A known id is replaced in place.
    pub(crate) fn apply_created(&mut self, message: MessagePayload) {
        if let Some(existing) = self.message_mut(message.message_id) {
            debug!(
                message_id = message.message_id.0,
                "messages: live message already present; replacing"
            );
            *existing = message;
            return;
        }
        let key = (message.sent_at, message.message_id);
        let position = self
            .messages
            .partition_point(|held| (held.sent_at, held.message_id) <= key);
        self.messages.insert(position, message);
    }

    pub(crate) fn apply_edited(
        &mut self,
        message_id: MessageId,
        content: String,
        edited_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> bool {
        let Some(message) = self.message_mut(message_id) else {
            return false;
        };
        message.content = content;
        message.edited_at = edited_at.or(message.edited_at);
        true
    }

    pub(crate) fn apply_deleted(&mut self, message_id: MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|message| message.message_id != message_id);
        if self.reply_to == Some(message_id) {
            self.reply_to = None;
        }
        if self.editing == Some(message_id) {
            self.editing = None;
        }
        self.messages.len() != before
    }

    /// Applies one reaction add or remove. Only the acting identity's own
    /// events move `reacted_by_me`.
    pub(crate) fn apply_reaction(
        &mut self,
        message_id: MessageId,
        emoji: &str,
        username: &str,
        added: bool,
        by_me: bool,
    ) -> bool {
        let Some(message) = self.message_mut(message_id) else {
            return false;
        };
        let position = message
            .reactions
            .iter()
            .position(|reaction| reaction.emoji == emoji);

        match (position, added) {
            (Some(index), true) => {
                let reaction = &mut message.reactions[index];
                reaction.count += 1;
                if !reaction.reactor_names.iter().any(|name| name == username) {
                    reaction.reactor_names.push(username.to_string());
                }
                if by_me {
                    reaction.reacted_by_me = true;
                }
            }
            (None, true) => message.reactions.push(ReactionSummary {
                emoji: emoji.to_string(),
                count: 1,
                reacted_by_me: by_me,
                reactor_names: vec![username.to_string()],
            }),
            (Some(index), false) => {
                let reaction = &mut message.reactions[index];
                reaction.count = reaction.count.saturating_sub(1);
                if let Some(name_index) = reaction
                    .reactor_names
                    .iter()
                    .position(|name| name == username)
                {
                    reaction.reactor_names.remove(name_index);
                }
                if by_me {
                    reaction.reacted_by_me = false;
                }
                if reaction.count == 0 {
                    message.reactions.remove(index);
                }
            }
            (None, false) => return false,
        }
        true
    }

    pub(crate) fn apply_link_previews(
        &mut self,
        message_id: MessageId,
        previews: Vec<LinkPreview>,
    ) -> bool {
        match self.message_mut(message_id) {
            Some(message) => {
                message.link_previews = previews;
                true
            }
            None => false,
        }
    }
}

impl SessionContext {
    /// Drops every typing entry along with its expiry timer.
    pub(crate) fn clear_typing(&mut self) {
        self.typing.clear();
        self.timers
            .cancel_where(|key| matches!(key, TimerKey::Typing(_)));
    }

    pub(crate) fn upsert_channel(&mut self, channel: ChannelSummary) {
        if self.channel.is_selected(channel.channel_id) {
            self.channel.channel_name = Some(channel.name.clone());
        }
        match self
            .channels
            .iter_mut()
            .find(|held| held.channel_id == channel.channel_id)
        {
            Some(held) => *held = channel,
            None => self.channels.push(channel),
        }
        self.channels
            .sort_by_key(|channel| (channel.position, channel.channel_id));
    }

    pub(crate) fn remove_channel(&mut self, channel_id: ChannelId) -> bool {
        let before = self.channels.len();
        self.channels.retain(|channel| channel.channel_id != channel_id);
        self.channels.len() != before
    }
}

impl SessionEngine {
    /// Resets the channel session, joins the channel on the stream and loads
    /// its latest page. The reset happens before the fetch is issued.
    pub async fn select_channel(self: &Arc<Self>, channel_id: ChannelId, name: impl Into<String>) {
        let epoch = {
            let mut guard = self.inner.lock().await;
            guard.clear_typing();
            guard.timers.cancel(&TimerKey::SendError);
            guard.timers.cancel(&TimerKey::RateLimit);
            guard.channel.reset_for(channel_id, name.into());
            self.emit_all([
                ClientEvent::MessagesChanged { channel_id },
                ClientEvent::TypingChanged { channel_id },
            ]);
            guard.channel.epoch
        };
        info!(channel_id = channel_id.0, "messages: selected channel");

        if let Err(err) = self.transport.join_channel(channel_id) {
            warn!(channel_id = channel_id.0, "messages: join channel failed: {err:#}");
        }
        self.fetch_latest(channel_id, epoch).await;
    }

    /// Selects the first text channel, or clears the selection when none exist.
    pub(crate) async fn select_default_channel(self: &Arc<Self>) {
        let fallback = {
            let mut guard = self.inner.lock().await;
            let fallback = guard.default_text_channel(None);
            if fallback.is_none() {
                guard.clear_typing();
                let epoch = guard.channel.epoch + 1;
                guard.channel = ChannelSession {
                    epoch,
                    ..ChannelSession::default()
                };
            }
            fallback
        };
        match fallback {
            Some((channel_id, name)) => self.select_channel(channel_id, name).await,
            None => debug!("messages: no text channel left to select"),
        }
    }

    /// Fetches the newest page and merges it with whatever the stream has
    /// delivered in the meantime.
    pub(crate) async fn fetch_latest(self: &Arc<Self>, channel_id: ChannelId, epoch: u64) {
        let page_size = self.settings.page_size;
        let fetched = match self.data.fetch_messages(channel_id, page_size, None).await {
            Ok(page) => page,
            Err(err) => {
                self.fetch_failed("latest history", channel_id, err).await;
                return;
            }
        };

        let mut guard = self.inner.lock().await;
        if guard.channel.epoch != epoch || !guard.channel.is_selected(channel_id) {
            debug!(
                channel_id = channel_id.0,
                "messages: discarding history page for a channel no longer selected"
            );
            return;
        }
        let has_more = fetched.len() >= page_size as usize;
        let merged = merge_page(fetched, &guard.channel.messages);
        debug!(
            channel_id = channel_id.0,
            count = merged.len(),
            has_more,
            "messages: merged latest page"
        );
        guard.channel.messages = merged;
        guard.channel.has_more = has_more;
        self.emit(ClientEvent::MessagesChanged { channel_id });
    }

    /// Loads the page strictly older than the oldest loaded message.
    pub async fn load_older_messages(self: &Arc<Self>) {
        let (channel_id, epoch, cursor) = {
            let mut guard = self.inner.lock().await;
            let session = &mut guard.channel;
            let (Some(channel_id), Some(oldest)) = (session.channel_id, session.messages.first())
            else {
                return;
            };
            if session.loading_more || !session.has_more {
                return;
            }
            let cursor = oldest.sent_at;
            session.loading_more = true;
            (channel_id, session.epoch, cursor)
        };

        let page_size = self.settings.page_size;
        let result = self
            .data
            .fetch_messages(channel_id, page_size, Some(cursor))
            .await;

        let mut guard = self.inner.lock().await;
        if guard.channel.epoch != epoch {
            // The reset that bumped the epoch already cleared `loading_more`.
            debug!(
                channel_id = channel_id.0,
                "messages: discarding older page for a channel no longer selected"
            );
            return;
        }
        guard.channel.loading_more = false;

        let page = match result {
            Ok(page) => page,
            Err(err) => {
                drop(guard);
                self.fetch_failed("older history", channel_id, err).await;
                return;
            }
        };

        let has_more = page.len() >= page_size as usize;
        let known: HashSet<MessageId> = guard
            .channel
            .messages
            .iter()
            .map(|message| message.message_id)
            .collect();
        let mut combined: Vec<MessagePayload> = page
            .into_iter()
            .filter(|message| !known.contains(&message.message_id))
            .collect();
        let added = combined.len();

        self.scroll.capture();
        combined.append(&mut guard.channel.messages);
        combined.sort_by_key(|message| (message.sent_at, message.message_id));
        guard.channel.messages = combined;
        guard.channel.has_more = has_more;
        self.scroll.restore();

        debug!(channel_id = channel_id.0, added, has_more, "messages: prepended older page");
        self.emit(ClientEvent::MessagesChanged { channel_id });
    }

    /// Fetch failures keep prior state. Auth expiry is fatal.
    async fn fetch_failed(self: &Arc<Self>, what: &str, channel_id: ChannelId, err: anyhow::Error) {
        if crate::is_auth_expired(&err) {
            let mut guard = self.inner.lock().await;
            self.force_logout(&mut guard, crate::LogoutReason::AuthExpired);
            return;
        }
        warn!(channel_id = channel_id.0, "messages: {what} fetch failed: {err:#}");
        self.emit(ClientEvent::Error(format!("failed to load {what}: {err}")));
    }

    /// Maps a failed round-trip command to its typed error, logging out on auth expiry.
    pub(crate) async fn command_failed(
        self: &Arc<Self>,
        what: &str,
        err: anyhow::Error,
    ) -> ClientError {
        let err = ClientError::from_collaborator(err);
        if matches!(err, ClientError::AuthExpired) {
            let mut guard = self.inner.lock().await;
            self.force_logout(&mut guard, crate::LogoutReason::AuthExpired);
        } else {
            warn!("session: {what} failed: {err}");
        }
        err
    }

    async fn selected_channel(&self) -> Result<ChannelId, ClientError> {
        self.inner
            .lock()
            .await
            .channel
            .channel_id
            .ok_or(ClientError::NoChannelSelected)
    }

    /// Adds or removes the local user's reaction depending on whether they
    /// already reacted. Local state only changes via the echoed event.
    pub async fn toggle_reaction(
        self: &Arc<Self>,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<(), ClientError> {
        let (channel_id, reacted) = {
            let guard = self.inner.lock().await;
            let channel_id = guard
                .channel
                .channel_id
                .ok_or(ClientError::NoChannelSelected)?;
            let reacted = guard
                .channel
                .message(message_id)
                .and_then(|message| {
                    message
                        .reactions
                        .iter()
                        .find(|reaction| reaction.emoji == emoji)
                })
                .is_some_and(|reaction| reaction.reacted_by_me);
            (channel_id, reacted)
        };

        let result = if reacted {
            self.data.remove_reaction(channel_id, message_id, emoji).await
        } else {
            self.data.add_reaction(channel_id, message_id, emoji).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self.command_failed("reaction toggle", err).await),
        }
    }

    pub async fn send_message(
        self: &Arc<Self>,
        content: &str,
        attachment_ids: &[FileId],
    ) -> Result<(), ClientError> {
        let (channel_id, reply_to, epoch) = {
            let guard = self.inner.lock().await;
            let channel_id = guard
                .channel
                .channel_id
                .ok_or(ClientError::NoChannelSelected)?;
            if guard.me.is_none() {
                return Err(ClientError::NotConnected);
            }
            (channel_id, guard.channel.reply_to, guard.channel.epoch)
        };
        if content.trim().is_empty() && attachment_ids.is_empty() {
            return Ok(());
        }

        let outcome = self
            .transport
            .send_message(channel_id, content, attachment_ids, reply_to)
            .await;

        let err = match outcome {
            Ok(SendAck::Accepted) => {
                let mut guard = self.inner.lock().await;
                if guard.channel.epoch == epoch {
                    guard.channel.reply_to = None;
                    guard.channel.send_error = false;
                    guard.timers.cancel(&TimerKey::SendError);
                    self.emit(ClientEvent::BannerChanged);
                }
                return Ok(());
            }
            Ok(SendAck::Rejected { reason }) => ClientError::CommandRejected { reason },
            Err(err) => ClientError::from_collaborator(err),
        };

        let mut guard = self.inner.lock().await;
        if matches!(err, ClientError::AuthExpired) {
            self.force_logout(&mut guard, crate::LogoutReason::AuthExpired);
            return Err(err);
        }
        warn!(channel_id = channel_id.0, "messages: send failed: {err}");
        if guard.channel.epoch == epoch {
            self.show_banner(&mut guard, Banner::SendError);
        }
        Err(err)
    }

    /// Forwards a typing signal at most once per debounce window.
    pub async fn send_typing(&self) -> Result<(), ClientError> {
        let channel_id = {
            let mut guard = self.inner.lock().await;
            let channel_id = guard
                .channel
                .channel_id
                .ok_or(ClientError::NoChannelSelected)?;
            let now = tokio::time::Instant::now();
            if let Some(last) = guard.last_typing_sent {
                if now.duration_since(last) < self.settings.typing_debounce {
                    return Ok(());
                }
            }
            guard.last_typing_sent = Some(now);
            channel_id
        };
        self.transport
            .send_typing(channel_id)
            .map_err(ClientError::from_collaborator)
    }

    /// Records an incoming typing signal, extending the user's expiry window.
    pub(crate) fn note_typing(
        &self,
        ctx: &mut SessionContext,
        channel_id: ChannelId,
        user_id: UserId,
        display_name: String,
    ) {
        if !ctx.channel.is_selected(channel_id) || ctx.is_local(user_id) {
            return;
        }
        ctx.typing
            .insert(user_id, crate::state::TypingEntry { display_name });
        self.schedule_timer(ctx, TimerKey::Typing(user_id), self.settings.typing_expiry);
        self.emit(ClientEvent::TypingChanged { channel_id });
    }

    pub async fn start_reply(&self, message_id: MessageId) -> Result<(), ClientError> {
        let mut guard = self.inner.lock().await;
        let channel_id = guard
            .channel
            .channel_id
            .ok_or(ClientError::NoChannelSelected)?;
        guard.channel.reply_to = Some(message_id);
        guard.channel.editing = None;
        self.emit(ClientEvent::MessagesChanged { channel_id });
        Ok(())
    }

    pub async fn cancel_reply(&self) {
        let mut guard = self.inner.lock().await;
        if guard.channel.reply_to.take().is_some() {
            if let Some(channel_id) = guard.channel.channel_id {
                self.emit(ClientEvent::MessagesChanged { channel_id });
            }
        }
    }

    /// Only the local user's own loaded messages can be edited.
    pub async fn start_edit(&self, message_id: MessageId) -> Result<(), ClientError> {
        let mut guard = self.inner.lock().await;
        let channel_id = guard
            .channel
            .channel_id
            .ok_or(ClientError::NoChannelSelected)?;
        let me = guard.local_user_id().ok_or(ClientError::NotConnected)?;
        match guard.channel.message(message_id) {
            Some(message) if message.author_id == me => {}
            Some(_) => {
                return Err(ClientError::CommandRejected {
                    reason: "only your own messages can be edited".into(),
                })
            }
            None => {
                return Err(ClientError::CommandRejected {
                    reason: format!("message {} is not loaded", message_id.0),
                })
            }
        }
        guard.channel.editing = Some(message_id);
        guard.channel.reply_to = None;
        self.emit(ClientEvent::MessagesChanged { channel_id });
        Ok(())
    }

    pub async fn cancel_edit(&self) {
        let mut guard = self.inner.lock().await;
        if guard.channel.editing.take().is_some() {
            if let Some(channel_id) = guard.channel.channel_id {
                self.emit(ClientEvent::MessagesChanged { channel_id });
            }
        }
    }

    /// Sends the edit for the message being edited. The content itself
    /// changes when the `message_edited` event arrives.
    pub async fn submit_edit(self: &Arc<Self>, content: &str) -> Result<(), ClientError> {
        let (channel_id, message_id, epoch) = {
            let guard = self.inner.lock().await;
            let channel_id = guard
                .channel
                .channel_id
                .ok_or(ClientError::NoChannelSelected)?;
            let message_id = guard.channel.editing.ok_or_else(|| ClientError::CommandRejected {
                reason: "no message is being edited".into(),
            })?;
            (channel_id, message_id, guard.channel.epoch)
        };

        if let Err(err) = self.data.edit_message(channel_id, message_id, content).await {
            return Err(self.command_failed("message edit", err).await);
        }

        let mut guard = self.inner.lock().await;
        if guard.channel.epoch == epoch && guard.channel.editing == Some(message_id) {
            guard.channel.editing = None;
            self.emit(ClientEvent::MessagesChanged { channel_id });
        }
        Ok(())
    }

    pub async fn delete_message(self: &Arc<Self>, message_id: MessageId) -> Result<(), ClientError> {
        let channel_id = self.selected_channel().await?;
        match self.data.delete_message(channel_id, message_id).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.command_failed("message delete", err).await),
        }
    }

    pub async fn create_channel(
        self: &Arc<Self>,
        name: &str,
        kind: ChannelKind,
    ) -> Result<ChannelSummary, ClientError> {
        match self.data.create_channel(name, kind).await {
            Ok(channel) => {
                info!(channel_id = channel.channel_id.0, "messages: channel created");
                Ok(channel)
            }
            Err(err) => Err(self.command_failed("channel create", err).await),
        }
    }

    pub async fn rename_channel(
        self: &Arc<Self>,
        channel_id: ChannelId,
        name: &str,
    ) -> Result<(), ClientError> {
        match self.data.rename_channel(channel_id, name).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.command_failed("channel rename", err).await),
        }
    }

    pub async fn delete_channel(self: &Arc<Self>, channel_id: ChannelId) -> Result<(), ClientError> {
        match self.data.delete_channel(channel_id).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.command_failed("channel delete", err).await),
        }
    }
}
