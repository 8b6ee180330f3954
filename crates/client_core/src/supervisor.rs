use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    error::ClientError,
    state::{ResetScope, SessionPhase},
    ClientEvent, SessionEngine,
};

impl SessionEngine {
    /// Throws away everything learned from the server and bootstraps again.
    /// The local media session is left running.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), ClientError> {
        {
            let mut guard = self.inner.lock().await;
            if guard.connecting {
                debug!("session: reconnect already in progress");
                return Ok(());
            }
            if guard.phase == SessionPhase::Disconnected {
                debug!("session: reconnect signal while disconnected; ignoring");
                return Ok(());
            }
            guard.connecting = true;
            self.detach_stream_handler(&mut guard);
            guard.reset(ResetScope::Reconnect);
            self.set_phase(&mut guard, SessionPhase::Reconnecting);
            self.emit_all([
                ClientEvent::ChannelsChanged,
                ClientEvent::PresenceChanged,
                ClientEvent::VoiceChanged,
                ClientEvent::BannerChanged,
            ]);
        }
        info!("session: reconnecting");

        let result = self.bootstrap_sequence(ResetScope::Reconnect).await;
        self.inner.lock().await.connecting = false;
        result
    }

    /// Explicit teardown back to `Disconnected`.
    pub async fn disconnect(self: &Arc<Self>) {
        let was_in_voice = {
            let mut guard = self.inner.lock().await;
            self.detach_stream_handler(&mut guard);
            let was_in_voice = guard.voice.local_channel.is_some();
            guard.reset(ResetScope::Full);
            self.set_phase(&mut guard, SessionPhase::Disconnected);
            self.emit_all([
                ClientEvent::ChannelsChanged,
                ClientEvent::PresenceChanged,
                ClientEvent::VoiceChanged,
                ClientEvent::BannerChanged,
            ]);
            was_in_voice
        };
        info!("session: disconnected");

        if let Err(err) = self.transport.disconnect().await {
            debug!("session: transport disconnect failed: {err:#}");
        }
        if was_in_voice {
            if let Err(err) = self.media.leave().await {
                debug!("session: media leave failed: {err:#}");
            }
        }
    }
}
