use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use sharecast_protocol::{Registration, SignalingConfig, SignalingEnvelope};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::engine::{SignalSink, SignalingConnector};
use crate::events::{EventSender, SessionEvent};

/// How long `close` waits for the close frame to go out.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

enum Outbound {
    Envelope(SignalingEnvelope),
    Close,
}

/// Outbound handle for one signaling connection. Envelopes sent before the
/// socket opens are queued and flushed right after registration.
pub struct SignalingChannel {
    tx: mpsc::UnboundedSender<Outbound>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl SignalSink for SignalingChannel {
    fn send(&self, envelope: SignalingEnvelope) {
        if self.tx.send(Outbound::Envelope(envelope)).is_err() {
            debug!("Signaling channel gone, dropping envelope");
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        let _ = self.tx.send(Outbound::Close);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(task) = task else {
            return Ok(());
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, task).await {
            Ok(joined) => joined.context("Signaling task failed"),
            Err(_) => anyhow::bail!("Signaling close did not finish within {CLOSE_TIMEOUT:?}"),
        }
    }
}

/// Opens WebSocket signaling connections to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    tls_cert: Option<String>,
    max_message_size: usize,
}

impl WsConnector {
    pub fn new(config: &SignalingConfig) -> Self {
        Self {
            url: config.url.clone(),
            tls_cert: config.tls_cert.clone(),
            max_message_size: config.max_message_size,
        }
    }
}

impl SignalingConnector for WsConnector {
    fn connect(&self, device_id: &str, events: EventSender) -> Arc<dyn SignalSink> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = self.clone();
        let device_id = device_id.to_string();
        let task = tokio::spawn(async move {
            connector.run(device_id, rx, events).await;
        });
        Arc::new(SignalingChannel {
            tx,
            task: Mutex::new(Some(task)),
        })
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

impl WsConnector {
    async fn open(&self) -> anyhow::Result<WsStream> {
        let connector = if self.url.starts_with("wss://") {
            Some(build_tls_connector(self.tls_cert.as_deref())?)
        } else {
            None
        };
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.max_message_size);
        let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(
            self.url.as_str(),
            Some(ws_config),
            false,
            connector,
        )
        .await
        .context("WebSocket connection failed")?;
        Ok(ws_stream)
    }

    async fn run(
        &self,
        device_id: String,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        events: EventSender,
    ) {
        info!(url = %self.url, "Connecting to signaling server");

        let mut pending = Vec::new();
        let connect = self.open();
        tokio::pin!(connect);
        let ws_stream = loop {
            tokio::select! {
                res = &mut connect => match res {
                    Ok(ws) => break ws,
                    Err(e) => {
                        warn!("Signaling connect failed: {e:#}");
                        events.emit(SessionEvent::SignalingClosed);
                        return;
                    }
                },
                cmd = outbound.recv() => match cmd {
                    Some(Outbound::Envelope(envelope)) => pending.push(envelope),
                    Some(Outbound::Close) | None => {
                        info!("Signaling closed before connect completed");
                        events.emit(SessionEvent::SignalingClosed);
                        return;
                    }
                },
            }
        };

        info!("Connected to signaling server");
        events.emit(SessionEvent::SignalingOpened);
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        match Registration::device(&device_id).encode() {
            Ok(text) => {
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    warn!("Failed to send registration: {e}");
                }
            }
            Err(e) => warn!("Failed to encode registration: {e}"),
        }
        for envelope in pending.drain(..) {
            send_envelope(&mut ws_tx, &envelope).await;
        }

        loop {
            tokio::select! {
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => match SignalingEnvelope::decode(&text) {
                        Ok(envelope) => {
                            debug!(kind = envelope.kind(), "Signaling message received");
                            events.emit(SessionEvent::Signal(envelope));
                        }
                        Err(e) => warn!("Discarding signaling frame: {e}"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "Signaling server closed the connection");
                        break;
                    }
                    None => {
                        info!("Signaling connection ended");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("Signaling connection error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
                cmd = outbound.recv() => match cmd {
                    Some(Outbound::Envelope(envelope)) => send_envelope(&mut ws_tx, &envelope).await,
                    Some(Outbound::Close) | None => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "stop".into(),
                        };
                        if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
                            debug!("Failed to send close frame: {e}");
                        }
                        info!("Signaling connection closed");
                        break;
                    }
                },
            }
        }
        events.emit(SessionEvent::SignalingClosed);
    }
}

async fn send_envelope<S>(ws_tx: &mut S, envelope: &SignalingEnvelope)
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = match envelope.encode() {
        Ok(text) => text,
        Err(e) => {
            warn!(kind = envelope.kind(), "Failed to encode envelope: {e}");
            return;
        }
    };
    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
        warn!(kind = envelope.kind(), "Failed to send envelope: {e}");
    }
}

/// Build a TLS connector from the platform roots, pinning the server
/// certificate if a cert path is provided.
fn build_tls_connector(tls_cert_path: Option<&str>) -> anyhow::Result<tokio_tungstenite::Connector> {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Error loading platform certs: {e}");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        let pem_data = std::fs::read(cert_path)
            .with_context(|| format!("Failed to read TLS cert {cert_path}"))?;
        for cert in rustls_pemfile::certs(&mut pem_data.as_slice()) {
            let cert = cert.context("Invalid PEM in pinned certificate")?;
            root_store
                .add(cert)
                .context("Failed to add pinned cert to root store")?;
        }
        info!("Pinned server certificate from {cert_path}");
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(tokio_tungstenite::Connector::Rustls(Arc::new(tls_config)))
}
