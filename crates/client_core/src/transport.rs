//! WebSocket streaming transport.
//!
//! One background task owns the socket. Outbound frames are queued on an
//! unbounded channel; inbound text frames decode as [`ServerFrame`] and are
//! either handed to the registered event handler or matched to a pending
//! `send_message` by request id. When the socket drops the task re-dials after
//! a fixed delay and, once connected again, fires the reconnect handler.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ChannelId, FileId, MessageId},
    protocol::{ClientRequest, ServerFrame},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::websocket_url, error::ClientError, ClientSettings, ReconnectHandler, SendAck,
    StreamEventHandler, StreamTransport,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct TransportState {
    outbound: Option<mpsc::UnboundedSender<Message>>,
    handler: Option<Arc<dyn StreamEventHandler>>,
    reconnect_handler: Option<Arc<dyn ReconnectHandler>>,
    pending_acks: HashMap<String, oneshot::Sender<SendAck>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<TransportState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<ServerFrame>(text) {
            Ok(ServerFrame::Event(event)) => {
                let handler = self.lock().handler.clone();
                match handler {
                    Some(handler) => handler.on_event(event),
                    None => debug!("session: no stream handler registered; dropping event"),
                }
            }
            Ok(ServerFrame::Ack {
                request_id,
                accepted,
                reason,
            }) => {
                let Some(waiter) = self.lock().pending_acks.remove(&request_id) else {
                    debug!(%request_id, "session: ack for unknown request");
                    return;
                };
                let ack = if accepted {
                    SendAck::Accepted
                } else {
                    SendAck::Rejected {
                        reason: reason.unwrap_or_else(|| "rejected by server".into()),
                    }
                };
                let _ = waiter.send(ack);
            }
            Err(err) => warn!("session: invalid server frame: {err}"),
        }
    }

    fn is_closed(&self) -> bool {
        self.lock().outbound.is_none()
    }
}

enum ConnectionEnd {
    Dropped,
    Closed,
}

pub struct WsTransport {
    url: Url,
    reconnect_delay: Duration,
    command_timeout: Duration,
    shared: Arc<Shared>,
}

impl WsTransport {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        let mut url = websocket_url(&settings.server_url)?;
        if let Some(token) = &settings.auth_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(Self {
            url,
            reconnect_delay: settings.transport_reconnect_delay,
            command_timeout: settings.command_timeout,
            shared: Arc::default(),
        })
    }

    fn send_request(&self, request: &ClientRequest) -> Result<()> {
        let text = serde_json::to_string(request)?;
        let outbound = self
            .shared
            .lock()
            .outbound
            .clone()
            .ok_or(ClientError::NotConnected)?;
        outbound
            .send(Message::Text(text))
            .map_err(|_| ClientError::NotConnected)?;
        Ok(())
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.outbound = None;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }
}

async fn dial(url: &Url) -> Result<WsStream> {
    let (stream, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect websocket: {}", url.path()))?;
    Ok(stream)
}

async fn run_connection(
    shared: Arc<Shared>,
    mut stream: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    url: Url,
    reconnect_delay: Duration,
) {
    loop {
        if let ConnectionEnd::Closed = pump(&shared, stream, &mut outbound_rx).await {
            return;
        }
        // Acks for requests on the dead socket will never arrive.
        shared.lock().pending_acks.clear();
        warn!("session: websocket dropped; re-dialing");

        stream = loop {
            tokio::time::sleep(reconnect_delay).await;
            if shared.is_closed() {
                return;
            }
            match dial(&url).await {
                Ok(stream) => break stream,
                Err(err) => warn!("session: websocket re-dial failed: {err:#}"),
            }
        };
        info!("session: websocket re-established");

        let reconnect_handler = shared.lock().reconnect_handler.clone();
        if let Some(handler) = reconnect_handler {
            handler.on_reconnected();
        }
    }
}

async fn pump(
    shared: &Shared,
    stream: WsStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<Message>,
) -> ConnectionEnd {
    let (mut writer, mut reader) = stream.split();
    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => match outgoing {
                Some(message) => {
                    if let Err(err) = writer.send(message).await {
                        warn!("session: websocket send failed: {err}");
                        return ConnectionEnd::Dropped;
                    }
                }
                None => {
                    let _ = writer.close().await;
                    return ConnectionEnd::Closed;
                }
            },
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.handle_frame(&text),
                Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Dropped,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("session: websocket receive failed: {err}");
                    return ConnectionEnd::Dropped;
                }
            },
        }
    }
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn connect(&self) -> Result<()> {
        let running = |state: &TransportState| {
            state
                .task
                .as_ref()
                .is_some_and(|task| !task.is_finished())
        };
        if running(&self.shared.lock()) {
            return Ok(());
        }

        let stream = dial(&self.url).await?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let mut state = self.shared.lock();
        if running(&state) {
            debug!("session: concurrent connect won; dropping extra socket");
            return Ok(());
        }
        state.outbound = Some(outbound);
        state.task = Some(tokio::spawn(run_connection(
            Arc::clone(&self.shared),
            stream,
            outbound_rx,
            self.url.clone(),
            self.reconnect_delay,
        )));
        info!("session: websocket connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let task = {
            let mut state = self.shared.lock();
            state.outbound = None;
            state.pending_acks.clear();
            state.task.take()
        };
        let Some(task) = task else {
            return Ok(());
        };
        let abort = task.abort_handle();
        if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
            abort.abort();
        }
        Ok(())
    }

    fn join_channel(&self, channel_id: ChannelId) -> Result<()> {
        self.send_request(&ClientRequest::JoinChannel { channel_id })
    }

    async fn send_message(
        &self,
        channel_id: ChannelId,
        content: &str,
        attachment_ids: &[FileId],
        reply_to: Option<MessageId>,
    ) -> Result<SendAck> {
        let request_id = Uuid::new_v4().to_string();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared
            .lock()
            .pending_acks
            .insert(request_id.clone(), ack_tx);

        let sent = self.send_request(&ClientRequest::SendMessage {
            request_id: request_id.clone(),
            channel_id,
            content: content.to_string(),
            attachment_ids: attachment_ids.to_vec(),
            reply_to,
        });
        if let Err(err) = sent {
            self.shared.lock().pending_acks.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(self.command_timeout, ack_rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(ClientError::Transport(
                "connection dropped before the message was acknowledged".into(),
            )
            .into()),
            Err(_) => {
                self.shared.lock().pending_acks.remove(&request_id);
                Err(ClientError::Transport("timed out waiting for message acknowledgement".into()).into())
            }
        }
    }

    fn send_typing(&self, channel_id: ChannelId) -> Result<()> {
        self.send_request(&ClientRequest::Typing { channel_id })
    }

    fn set_event_handler(&self, handler: Arc<dyn StreamEventHandler>) {
        self.shared.lock().handler = Some(handler);
    }

    fn clear_event_handler(&self) {
        self.shared.lock().handler = None;
    }

    fn set_reconnect_handler(&self, handler: Arc<dyn ReconnectHandler>) {
        self.shared.lock().reconnect_handler = Some(handler);
    }
}
