use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::{
    error::ClientError,
    state::{ResetScope, SessionPhase},
    ClientEvent, LogoutReason, SessionEngine,
};

impl SessionEngine {
    /// Bootstraps the session: snapshot, then stream, then the default
    /// channel's history. Concurrent calls collapse into one attempt and
    /// report its outcome: `NotConnected` when it ended `Disconnected`.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        {
            let mut guard = self.inner.lock().await;
            if guard.connecting {
                debug!(phase = ?guard.phase, "session: connect already in progress; awaiting it");
                // Phase changes are emitted under this lock, so none are missed.
                let events = self.events.subscribe();
                drop(guard);
                return self.await_connect_outcome(events).await;
            }
            if guard.phase != SessionPhase::Disconnected {
                debug!(phase = ?guard.phase, "session: already connected");
                return Ok(());
            }
            guard.connecting = true;
            self.set_phase(&mut guard, SessionPhase::Connecting);
        }
        info!(server_url = %self.settings.server_url, "session: connecting");

        let result = self.bootstrap_sequence(ResetScope::Full).await;
        self.inner.lock().await.connecting = false;
        result
    }

    /// Shared by connect and reconnect. The caller owns the `connecting`
    /// latch and has already moved the phase to `Connecting` or `Reconnecting`.
    pub(crate) async fn bootstrap_sequence(
        self: &Arc<Self>,
        scope: ResetScope,
    ) -> Result<(), ClientError> {
        let snapshot = match self.data.bootstrap().await {
            Ok(snapshot) => snapshot,
            Err(err) => return Err(self.fail_bootstrap(err, scope).await),
        };
        let requested = self.navigator.requested_channel();

        let default_channel = {
            let mut guard = self.inner.lock().await;
            if !matches!(
                guard.phase,
                SessionPhase::Connecting | SessionPhase::Reconnecting
            ) {
                debug!(phase = ?guard.phase, "session: teardown raced bootstrap; dropping snapshot");
                return Err(ClientError::NotConnected);
            }
            guard.apply_bootstrap(snapshot);
            self.set_phase(&mut guard, SessionPhase::SnapshotLoaded);
            // Attach before any history fetch so no event is missed meanwhile.
            self.attach_stream_handler(&mut guard);
            self.emit_all([
                ClientEvent::ChannelsChanged,
                ClientEvent::PresenceChanged,
                ClientEvent::VoiceChanged,
            ]);
            guard.default_text_channel(requested)
        };

        if let Err(err) = self.transport.connect().await {
            return Err(self.fail_bootstrap(err, scope).await);
        }
        if scope == ResetScope::Full {
            let mut guard = self.inner.lock().await;
            self.set_phase(&mut guard, SessionPhase::StreamAttached);
        }

        match default_channel {
            Some((channel_id, name)) => self.select_channel(channel_id, name).await,
            None => debug!("session: no text channel to select"),
        }

        let mut guard = self.inner.lock().await;
        if guard.handler_registration.is_some() {
            self.set_phase(&mut guard, SessionPhase::Ready);
            info!("session: ready");
        }
        Ok(())
    }

    async fn await_connect_outcome(
        &self,
        mut events: broadcast::Receiver<ClientEvent>,
    ) -> Result<(), ClientError> {
        loop {
            let phase = match events.recv().await {
                Ok(ClientEvent::PhaseChanged(phase)) => phase,
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => self.phase().await,
                Err(RecvError::Closed) => return Err(ClientError::NotConnected),
            };
            match phase {
                SessionPhase::Ready => return Ok(()),
                SessionPhase::Disconnected => return Err(ClientError::NotConnected),
                _ => {}
            }
        }
    }

    /// Auth expiry logs out; anything else leaves a clean `Disconnected`
    /// session for a manual retry.
    async fn fail_bootstrap(self: &Arc<Self>, err: anyhow::Error, scope: ResetScope) -> ClientError {
        let err = ClientError::from_collaborator(err);
        let mut guard = self.inner.lock().await;
        if matches!(err, ClientError::AuthExpired) {
            self.force_logout(&mut guard, LogoutReason::AuthExpired);
            return err;
        }
        warn!("session: bootstrap failed: {err}");
        self.detach_stream_handler(&mut guard);
        guard.reset(scope);
        self.set_phase(&mut guard, SessionPhase::Disconnected);
        self.emit_all([
            ClientEvent::ChannelsChanged,
            ClientEvent::PresenceChanged,
            ClientEvent::VoiceChanged,
            ClientEvent::Error(format!("connection failed: {err}")),
        ]);
        err
    }
}
