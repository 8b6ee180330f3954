//! Voice participants, speaking indicators and producer consumption.
//!
//! Screen and camera producers are only consumed for the user the local
//! client is watching; every other label is consumed as soon as it appears in
//! the joined channel. Each producer id is consumed at most once per voice
//! session.

use std::sync::Arc;

use media_session::{MediaEvent, MediaToggle, SoundCue};
use shared::{
    domain::{ChannelId, ChannelKind, ProducerLabel, UserId},
    protocol::{ProducerSummary, VoiceParticipantPayload},
};
use tracing::{debug, info, warn};

use crate::{
    dispatcher::Deferred,
    error::ClientError,
    state::{clamp_volume, SessionContext, SessionPhase, VoiceState, WatchKind},
    ClientEvent, SessionEngine,
};

impl SessionContext {
    fn voice_concerns_me(&self, channel_id: ChannelId, user_id: UserId) -> bool {
        self.voice.local_channel == Some(channel_id) || self.is_local(user_id)
    }

    /// Decides whether `producer` should be consumed and, if so, marks it consumed.
    pub(crate) fn gate_producer(&mut self, channel_id: ChannelId, producer: &ProducerSummary) -> bool {
        if self.voice.local_channel != Some(channel_id) || self.is_local(producer.user_id) {
            return false;
        }
        let wanted = match WatchKind::for_label(producer.label) {
            None => true,
            Some(kind) => kind.target(&self.voice) == Some(producer.user_id),
        };
        if !wanted {
            debug!(
                user_id = producer.user_id.0,
                label = ?producer.label,
                "voice: skipping producer nobody is watching"
            );
            return false;
        }
        if self.voice.consumed.contains_key(&producer.producer_id) {
            debug!(producer_id = %producer.producer_id.0, "voice: producer already consumed");
            return false;
        }
        self.voice.consumed.insert(
            producer.producer_id.clone(),
            (producer.user_id, producer.label),
        );
        true
    }

    /// Replaces every participant of `channel_id` with the given list.
    pub(crate) fn replace_channel_participants(
        &mut self,
        channel_id: ChannelId,
        participants: Vec<VoiceParticipantPayload>,
    ) {
        self.voice
            .participants
            .retain(|(_, held_channel), _| *held_channel != channel_id);
        for participant in participants
            .into_iter()
            .filter(|participant| participant.channel_id == channel_id)
        {
            self.upsert_participant(participant);
        }
        let VoiceState {
            participants,
            speaking,
            ..
        } = &mut self.voice;
        speaking.retain(|user_id| participants.keys().any(|(held_user, _)| held_user == user_id));
    }

    /// Inserts a participant, dropping any stale entry for the same user.
    pub(crate) fn upsert_participant(&mut self, participant: VoiceParticipantPayload) {
        let user_id = participant.user_id;
        self.voice
            .participants
            .retain(|(held_user, _), _| *held_user != user_id);
        self.voice
            .participants
            .insert((user_id, participant.channel_id), participant);
    }

    fn forget_watched_media(&mut self, user_id: UserId, kind: WatchKind) {
        self.voice.forget_consumed(user_id, Some(kind.label()));
        self.voice.remote_tracks.remove(&(user_id, kind.label()));
    }

    /// Leaves the local voice session bookkeeping empty.
    fn clear_voice_session(&mut self) {
        self.voice.consumed.clear();
        self.voice.remote_tracks.clear();
        self.voice.screen_watch = None;
        self.voice.camera_watch = None;
    }
}

impl SessionEngine {
    pub(crate) fn apply_voice_joined(
        &self,
        ctx: &mut SessionContext,
        participant: VoiceParticipantPayload,
        deferred: &mut Vec<Deferred>,
    ) {
        let (user_id, channel_id) = (participant.user_id, participant.channel_id);
        ctx.upsert_participant(participant);
        if ctx.voice_concerns_me(channel_id, user_id) {
            deferred.push(Deferred::PlayCue(SoundCue::Connect));
        }
        self.emit(ClientEvent::VoiceChanged);
    }

    pub(crate) fn apply_voice_left(
        &self,
        ctx: &mut SessionContext,
        channel_id: ChannelId,
        user_id: UserId,
        deferred: &mut Vec<Deferred>,
    ) {
        let concerns_me = ctx.voice_concerns_me(channel_id, user_id);
        ctx.voice.participants.remove(&(user_id, channel_id));
        ctx.voice.speaking.remove(&user_id);
        if ctx.voice.local_channel == Some(channel_id) {
            ctx.voice.forget_consumed(user_id, None);
            ctx.voice
                .remote_tracks
                .retain(|(owner, _), _| *owner != user_id);
            for kind in [WatchKind::Screen, WatchKind::Camera] {
                let target = kind.target_mut(&mut ctx.voice);
                if *target == Some(user_id) {
                    *target = None;
                }
            }
        }
        if concerns_me {
            deferred.push(Deferred::PlayCue(SoundCue::Disconnect));
        }
        deferred.push(Deferred::RemoveAudio(user_id));
        self.emit(ClientEvent::VoiceChanged);
    }

    pub(crate) fn apply_voice_state(
        &self,
        ctx: &mut SessionContext,
        participant: VoiceParticipantPayload,
    ) {
        ctx.upsert_participant(participant);
        self.emit(ClientEvent::VoiceChanged);
    }

    pub(crate) fn apply_speaking(&self, ctx: &mut SessionContext, user_id: UserId, speaking: bool) {
        let changed = if speaking {
            ctx.voice.speaking.insert(user_id)
        } else {
            ctx.voice.speaking.remove(&user_id)
        };
        if changed {
            self.emit(ClientEvent::VoiceChanged);
        }
    }

    pub(crate) fn apply_new_producer(
        &self,
        ctx: &mut SessionContext,
        channel_id: ChannelId,
        producer: ProducerSummary,
        deferred: &mut Vec<Deferred>,
    ) {
        if ctx.gate_producer(channel_id, &producer) {
            deferred.push(Deferred::Consume(producer));
        }
    }

    /// Screen and camera share updates. Stopping a share only clears the
    /// watch target if it still points at that user.
    pub(crate) fn apply_share_update(
        &self,
        ctx: &mut SessionContext,
        kind: WatchKind,
        channel_id: ChannelId,
        user_id: UserId,
        active: bool,
    ) {
        if let Some(participant) = ctx.voice.participants.get_mut(&(user_id, channel_id)) {
            *kind.sharing_mut(participant) = active;
        }
        if !active {
            ctx.forget_watched_media(user_id, kind);
            let target = kind.target_mut(&mut ctx.voice);
            if *target == Some(user_id) {
                info!(user_id = user_id.0, ?kind, "voice: watched share ended");
                *target = None;
            }
        }
        self.emit(ClientEvent::VoiceChanged);
    }

    pub(crate) async fn apply_media_event(self: &Arc<Self>, event: MediaEvent) {
        let mut guard = self.inner.lock().await;
        match event {
            MediaEvent::VoiceStates {
                channel_id,
                participants,
            } => {
                guard.replace_channel_participants(channel_id, participants);
                self.emit(ClientEvent::VoiceChanged);
            }
            MediaEvent::Speaking { user_id, speaking } => {
                self.apply_speaking(&mut guard, user_id, speaking)
            }
            MediaEvent::LocalState(state) => {
                guard.voice.local = state;
                self.emit(ClientEvent::VoiceChanged);
            }
            MediaEvent::RemoteTrack(track) => {
                debug!(user_id = track.user_id.0, label = ?track.label, "voice: remote track arrived");
                guard
                    .voice
                    .remote_tracks
                    .insert((track.user_id, track.label), track.track_id);
                self.emit(ClientEvent::VoiceChanged);
            }
            MediaEvent::Reconnected { channel_id } => {
                if guard.voice.local_channel != Some(channel_id) {
                    debug!(channel_id = channel_id.0, "voice: ignoring reconnect of a channel we left");
                    return;
                }
                info!(channel_id = channel_id.0, "voice: media reconnected; re-consuming producers");
                guard.voice.consumed.clear();
                drop(guard);
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = engine.consume_existing_producers(channel_id, None).await {
                        warn!(channel_id = channel_id.0, "voice: producer reconciliation failed: {err}");
                    }
                });
            }
        }
    }

    pub(crate) async fn consume_producer(&self, producer: ProducerSummary) {
        let producer_id = producer.producer_id.clone();
        debug!(
            producer_id = %producer_id.0,
            user_id = producer.user_id.0,
            label = ?producer.label,
            "voice: consuming producer"
        );
        if let Err(err) = self.media.consume(producer).await {
            warn!(producer_id = %producer_id.0, "voice: consume failed: {err:#}");
            self.inner.lock().await.voice.consumed.remove(&producer_id);
        }
    }

    /// Consumes the channel's existing producers that pass the gate, limited
    /// to one `(user, label)` when given. Results for a channel we are no
    /// longer in are dropped.
    async fn consume_existing_producers(
        &self,
        channel_id: ChannelId,
        only: Option<(UserId, ProducerLabel)>,
    ) -> Result<(), ClientError> {
        let producers = self
            .media
            .list_producers(channel_id)
            .await
            .map_err(ClientError::from_collaborator)?;

        let wanted: Vec<ProducerSummary> = {
            let mut guard = self.inner.lock().await;
            if guard.voice.local_channel != Some(channel_id) {
                debug!(channel_id = channel_id.0, "voice: discarding producer list for a channel we left");
                return Ok(());
            }
            producers
                .into_iter()
                .filter(|producer| {
                    only.map_or(true, |(user_id, label)| {
                        producer.user_id == user_id && producer.label == label
                    })
                })
                .filter(|producer| guard.gate_producer(channel_id, producer))
                .collect()
        };
        for producer in wanted {
            self.consume_producer(producer).await;
        }
        Ok(())
    }

    /// Starts viewing `user_id`'s screen or camera, consuming a producer that
    /// may already exist.
    pub async fn watch(self: &Arc<Self>, kind: WatchKind, user_id: UserId) -> Result<(), ClientError> {
        let (channel_id, replaced) = {
            let mut guard = self.inner.lock().await;
            let channel_id = guard.voice.local_channel.ok_or(ClientError::NotInVoice)?;
            let replaced = kind
                .target_mut(&mut guard.voice)
                .replace(user_id)
                .filter(|previous| *previous != user_id);
            if let Some(previous) = replaced {
                guard.forget_watched_media(previous, kind);
            }
            self.emit(ClientEvent::VoiceChanged);
            (channel_id, replaced)
        };
        info!(user_id = user_id.0, ?kind, "voice: watching");

        if let Some(previous) = replaced {
            if let Err(err) = self.media.close_consumer(previous, kind.label()).await {
                warn!(user_id = previous.0, "voice: closing previous consumer failed: {err:#}");
            }
        }
        self.consume_existing_producers(channel_id, Some((user_id, kind.label())))
            .await
    }

    pub async fn watch_screen(self: &Arc<Self>, user_id: UserId) -> Result<(), ClientError> {
        self.watch(WatchKind::Screen, user_id).await
    }

    pub async fn watch_camera(self: &Arc<Self>, user_id: UserId) -> Result<(), ClientError> {
        self.watch(WatchKind::Camera, user_id).await
    }

    pub async fn stop_watching(&self, kind: WatchKind) -> Result<(), ClientError> {
        let user_id = {
            let mut guard = self.inner.lock().await;
            let Some(user_id) = kind.target_mut(&mut guard.voice).take() else {
                return Ok(());
            };
            guard.forget_watched_media(user_id, kind);
            self.emit(ClientEvent::VoiceChanged);
            user_id
        };
        self.media
            .close_consumer(user_id, kind.label())
            .await
            .map_err(ClientError::from_collaborator)
    }

    /// Runs one toggle at a time per kind; a repeat while one is pending is dropped.
    pub async fn toggle_media(self: &Arc<Self>, toggle: MediaToggle) -> Result<(), ClientError> {
        {
            let mut guard = self.inner.lock().await;
            if !guard.voice.toggles_in_flight.insert(toggle) {
                debug!(toggle = toggle.as_str(), "voice: toggle already in flight");
                return Ok(());
            }
        }

        let result = self.media.toggle(toggle).await;

        let mut guard = self.inner.lock().await;
        guard.voice.toggles_in_flight.remove(&toggle);
        match result {
            Ok(state) => {
                guard.voice.local = state;
                self.emit(ClientEvent::VoiceChanged);
                Ok(())
            }
            Err(err) => {
                drop(guard);
                Err(self.command_failed(toggle.as_str(), err).await)
            }
        }
    }

    pub async fn join_voice(self: &Arc<Self>, channel_id: ChannelId) -> Result<(), ClientError> {
        {
            let guard = self.inner.lock().await;
            if guard.phase == SessionPhase::Disconnected {
                return Err(ClientError::NotConnected);
            }
            if guard.voice.local_channel == Some(channel_id) {
                return Ok(());
            }
            let kind = guard
                .channels
                .iter()
                .find(|channel| channel.channel_id == channel_id)
                .map(|channel| channel.kind);
            if kind == Some(ChannelKind::Text) {
                return Err(ClientError::CommandRejected {
                    reason: format!("channel {} is not a voice channel", channel_id.0),
                });
            }
        }

        if let Err(err) = self.media.join(channel_id).await {
            return Err(self.command_failed("voice join", err).await);
        }
        {
            let mut guard = self.inner.lock().await;
            guard.clear_voice_session();
            guard.voice.local_channel = Some(channel_id);
            self.emit(ClientEvent::VoiceChanged);
        }
        info!(channel_id = channel_id.0, "voice: joined");
        self.consume_existing_producers(channel_id, None).await
    }

    pub async fn leave_voice(self: &Arc<Self>) -> Result<(), ClientError> {
        let channel_id = self
            .inner
            .lock()
            .await
            .voice
            .local_channel
            .ok_or(ClientError::NotInVoice)?;

        if let Err(err) = self.media.leave().await {
            return Err(self.command_failed("voice leave", err).await);
        }
        let mut guard = self.inner.lock().await;
        if guard.voice.local_channel == Some(channel_id) {
            guard.voice.local_channel = None;
            guard.clear_voice_session();
            self.emit(ClientEvent::VoiceChanged);
        }
        info!(channel_id = channel_id.0, "voice: left");
        Ok(())
    }

    pub async fn user_volume(&self, user_id: UserId) -> Result<f32, ClientError> {
        self.media
            .user_volume(user_id)
            .await
            .map(clamp_volume)
            .map_err(ClientError::from_collaborator)
    }

    /// Returns the volume actually applied after clamping to `0.0..=2.0`.
    pub async fn set_user_volume(&self, user_id: UserId, volume: f32) -> Result<f32, ClientError> {
        let volume = clamp_volume(volume);
        self.media
            .set_user_volume(user_id, volume)
            .await
            .map_err(ClientError::from_collaborator)?;
        Ok(volume)
    }
}
