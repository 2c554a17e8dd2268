//! The gateway RPC session.
//!
//! One WebSocket carries tagged request/response frames. Connecting means
//! answering the gateway's `connect.challenge` nonce (signed with the device
//! identity) within the handshake deadlines; afterwards a background read
//! loop demultiplexes responses to waiting callers by correlation id and
//! discards unsolicited events.
//!
//! ```text
//!   dial ──► event connect.challenge {nonce}      (10s deadline)
//!        ◄── req connect {auth, device: signed}   (reserved id "0")
//!   ok?  ──► res {ok:true}                        (10s deadline)
//!             └─ spawn read loop, ids count up from 1
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::GatewaySettings;
use crate::gateway::device::DeviceIdentity;
use crate::gateway::protocol::{
    classify_call_error, classify_connect_error, ConfigPatchParams, ConnectParams,
    ConnectRejection, Frame, FrameKind, AuthParams, ClientInfo, CONNECT_ID, PROTOCOL_MAX,
    PROTOCOL_MIN,
};
use crate::gateway::GatewayError;

/// Deadline for each of the two handshake reads.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for every post-connect call.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Delay passed with restart-triggering patches so in-flight work can drain.
const RESTART_DELAY_MS: u64 = 2000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;
type PendingMap = Arc<StdMutex<HashMap<String, oneshot::Sender<Frame>>>>;

/// Connection parameters for the gateway session.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub token: Option<String>,
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    pub device_key_path: PathBuf,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

impl GatewayConfig {
    pub fn new(url: impl Into<String>, device_key_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            token: None,
            client_id: "keywarden".to_string(),
            client_mode: "sidecar".to_string(),
            role: "operator".to_string(),
            scopes: vec![
                "config.read".to_string(),
                "config.write".to_string(),
                "device.pair".to_string(),
            ],
            caps: Vec::new(),
            device_key_path: device_key_path.into(),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 60,
        }
    }

    pub fn from_settings(settings: &GatewaySettings) -> Self {
        let mut config = Self::new(&settings.url, &settings.device_key_path);
        config.token = settings.token();
        config.reconnect_interval = settings.reconnect_interval;
        config.max_reconnect_attempts = settings.max_reconnect_attempts;
        config
    }
}

/// Where the session currently stands. Reads never block on an in-flight
/// handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    NeedsPairing { request_id: Option<String> },
    TokenMismatch,
}

/// A device row from `device.pair.list`. The gateway decides which fields it
/// sends; everything is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDevice {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub last_seen_at: Option<String>,
}

struct Session {
    sink: WsSink,
    next_id: u64,
    reader: JoinHandle<()>,
}

/// Authenticated RPC client for the downstream gateway.
pub struct GatewayRpcClient {
    config: GatewayConfig,
    device: DeviceIdentity,
    /// Live socket plus the correlation-id counter.
    session: Mutex<Option<Session>>,
    /// In-flight calls awaiting their `res` frame.
    pending: PendingMap,
    /// Separate lock so status reads never contend with the session.
    status: Arc<StdRwLock<ConnectionStatus>>,
}

impl GatewayRpcClient {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let device = DeviceIdentity::load_or_generate(&config.device_key_path)?;
        Ok(Self {
            config,
            device,
            session: Mutex::new(None),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            status: Arc::new(StdRwLock::new(ConnectionStatus::Disconnected)),
        })
    }

    pub fn device_id(&self) -> &str {
        self.device.device_id()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    // ── Handshake ────────────────────────────────────────────────

    /// Run the full connect handshake. On success the read loop is running
    /// and calls may be issued.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        if self.is_connected() {
            return Ok(());
        }

        let (ws, _response) = connect_async(self.config.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let nonce = wait_for_challenge(&mut stream).await?;

        let token = self.config.token.clone().unwrap_or_default();
        let device = self.device.sign_challenge(
            &self.config.client_id,
            &self.config.client_mode,
            &self.config.role,
            &self.config.scopes,
            &token,
            &nonce,
        );
        let params = ConnectParams {
            min_protocol: PROTOCOL_MIN,
            max_protocol: PROTOCOL_MAX,
            client: ClientInfo {
                id: self.config.client_id.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                platform: std::env::consts::OS.to_string(),
                mode: self.config.client_mode.clone(),
            },
            role: self.config.role.clone(),
            scopes: self.config.scopes.clone(),
            caps: self.config.caps.clone(),
            user_agent: format!("keywarden/{}", env!("CARGO_PKG_VERSION")),
            auth: self.config.token.clone().map(|token| AuthParams { token }),
            device: Some(device),
        };

        let frame = Frame::request(CONNECT_ID, "connect", serde_json::to_value(&params)?);
        sink.send(Message::Text(serde_json::to_string(&frame)?.into()))
            .await?;

        let res = wait_for_connect_res(&mut stream).await?;
        if !res.is_ok() {
            let message = res.error_message().to_string();
            return Err(match classify_connect_error(&message, res.payload.as_ref()) {
                ConnectRejection::NeedsPairing { request_id } => {
                    self.set_status(ConnectionStatus::NeedsPairing { request_id });
                    GatewayError::PairingRequired
                }
                ConnectRejection::TokenMismatch => {
                    self.set_status(ConnectionStatus::TokenMismatch);
                    GatewayError::TokenMismatch
                }
                ConnectRejection::Other(message) => {
                    self.set_status(ConnectionStatus::Disconnected);
                    GatewayError::ConnectRejected(message)
                }
            });
        }

        // Mark connected before the reader starts so a reader that exits
        // immediately cannot have its Disconnected write clobbered.
        self.set_status(ConnectionStatus::Connected);
        let reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&self.pending),
            Arc::clone(&self.status),
        ));

        let mut guard = self.session.lock().await;
        if let Some(old) = guard.take() {
            old.reader.abort();
        }
        // Correlation ids restart after the reserved connect id.
        *guard = Some(Session {
            sink,
            next_id: 1,
            reader,
        });
        Ok(())
    }

    /// Tear the session down (shutdown or tests).
    pub async fn disconnect(&self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            session.reader.abort();
        }
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Retry the handshake on a fixed interval whenever disconnected, with a
    /// bounded number of attempts per run. The pairing hint is surfaced once
    /// per disconnection episode.
    pub fn spawn_reconnect_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut attempts = 0u32;
            let mut pairing_hint_shown = false;
            loop {
                if client.is_connected() {
                    attempts = 0;
                    pairing_hint_shown = false;
                } else {
                    if attempts >= client.config.max_reconnect_attempts {
                        tracing::warn!(
                            attempts,
                            url = %client.config.url,
                            "Giving up on gateway reconnection"
                        );
                        return;
                    }
                    attempts += 1;
                    match client.connect().await {
                        Ok(()) => {
                            tracing::info!(url = %client.config.url, "Connected to gateway");
                            attempts = 0;
                            pairing_hint_shown = false;
                        }
                        Err(GatewayError::PairingRequired) => {
                            if !pairing_hint_shown {
                                pairing_hint_shown = true;
                                let request_id = match client.status() {
                                    ConnectionStatus::NeedsPairing {
                                        request_id: Some(id),
                                    } => id,
                                    _ => "<request-id>".to_string(),
                                };
                                tracing::warn!(
                                    device_id = %client.device_id(),
                                    "Gateway requires device pairing; approve this sidecar with: keywarden device approve {request_id}"
                                );
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Gateway reconnect attempt failed");
                        }
                    }
                }
                tokio::time::sleep(client.config.reconnect_interval).await;
            }
        })
    }

    // ── Calls ────────────────────────────────────────────────────

    /// Send one tagged request and block on its response. A timed-out call
    /// removes its pending entry so a late reply is dropped, not misdelivered.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let (id, rx) = {
            let mut guard = self.session.lock().await;
            let session = guard.as_mut().ok_or(GatewayError::NotConnected)?;

            let id = session.next_id.to_string();
            session.next_id += 1;

            let (tx, rx) = oneshot::channel();
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id.clone(), tx);

            let frame = Frame::request(id.clone(), method, params);
            let text = serde_json::to_string(&frame)?;
            if let Err(e) = session.sink.send(Message::Text(text.into())).await {
                self.pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&id);
                if let Some(dead) = guard.take() {
                    dead.reader.abort();
                }
                self.set_status(ConnectionStatus::Disconnected);
                return Err(e.into());
            }
            (id, rx)
        };

        match timeout(CALL_TIMEOUT, rx).await {
            Err(_elapsed) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                Err(GatewayError::CallTimeout {
                    method: method.to_string(),
                })
            }
            // The read loop dropped our sender: connection went away.
            Ok(Err(_closed)) => Err(GatewayError::NotConnected),
            Ok(Ok(frame)) => {
                if frame.is_ok() {
                    Ok(frame.payload.unwrap_or(serde_json::Value::Null))
                } else {
                    Err(classify_call_error(method, frame.error_message()))
                }
            }
        }
    }

    // ── Device pairing administration ────────────────────────────

    pub async fn list_devices(&self) -> Result<Vec<PairedDevice>, GatewayError> {
        let payload = self.call("device.pair.list", serde_json::json!({})).await?;
        let devices = payload
            .get("devices")
            .cloned()
            .unwrap_or_else(|| serde_json::json!([]));
        Ok(serde_json::from_value(devices)?)
    }

    pub async fn approve_device(&self, request_id: &str) -> Result<(), GatewayError> {
        self.call(
            "device.pair.approve",
            serde_json::json!({ "requestId": request_id }),
        )
        .await
        .map(|_| ())
    }

    pub async fn reject_device(&self, request_id: &str) -> Result<(), GatewayError> {
        self.call(
            "device.pair.reject",
            serde_json::json!({ "requestId": request_id }),
        )
        .await
        .map(|_| ())
    }

    // ── Config patching ──────────────────────────────────────────

    async fn current_config_hash(&self) -> Result<String, GatewayError> {
        let payload = self.call("config.get", serde_json::json!({})).await?;
        payload
            .get("hash")
            .and_then(|h| h.as_str())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::MalformedResponse {
                method: "config.get".to_string(),
                message: "missing content hash".to_string(),
            })
    }

    /// Apply a config patch under optimistic concurrency: the patch is tagged
    /// with the hash just read and rejected downstream if the config changed
    /// in between. Returns the new content hash.
    pub async fn patch_config(
        &self,
        patch: &serde_json::Value,
        reason: &str,
    ) -> Result<String, GatewayError> {
        let base_hash = self.current_config_hash().await?;
        let params = ConfigPatchParams {
            raw: serde_json::to_string_pretty(patch)?,
            base_hash,
            note: reason.to_string(),
            restart_delay_ms: RESTART_DELAY_MS,
        };
        let payload = self
            .call("config.patch", serde_json::to_value(&params)?)
            .await?;
        payload
            .get("hash")
            .and_then(|h| h.as_str())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::MalformedResponse {
                method: "config.patch".to_string(),
                message: "missing new hash".to_string(),
            })
    }

    /// Restart the downstream process by submitting a no-op patch; the
    /// gateway restarts itself after applying any patch.
    pub async fn restart_gateway(&self, reason: &str) -> Result<(), GatewayError> {
        let base_hash = self.current_config_hash().await?;
        let params = ConfigPatchParams {
            raw: "{}".to_string(),
            base_hash,
            note: reason.to_string(),
            restart_delay_ms: RESTART_DELAY_MS,
        };
        self.call("config.patch", serde_json::to_value(&params)?)
            .await
            .map(|_| ())
    }
}

// ── Handshake reads ──────────────────────────────────────────────

async fn wait_for_challenge(stream: &mut WsSource) -> Result<String, GatewayError> {
    timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            match stream.next().await {
                None => return Err(GatewayError::HandshakeClosed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => {
                    let frame: Frame = serde_json::from_str(&text)?;
                    if frame.kind == FrameKind::Event
                        && frame.event.as_deref() == Some("connect.challenge")
                    {
                        let nonce = frame
                            .payload
                            .as_ref()
                            .and_then(|p| p.get("nonce"))
                            .and_then(|n| n.as_str())
                            .map(str::to_string);
                        return nonce.ok_or_else(|| GatewayError::MalformedResponse {
                            method: "connect.challenge".to_string(),
                            message: "missing nonce".to_string(),
                        });
                    }
                    // Other pre-connect events are noise.
                }
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .map_err(|_| GatewayError::HandshakeTimeout("connect.challenge"))?
}

async fn wait_for_connect_res(stream: &mut WsSource) -> Result<Frame, GatewayError> {
    timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            match stream.next().await {
                None => return Err(GatewayError::HandshakeClosed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => {
                    let frame: Frame = serde_json::from_str(&text)?;
                    if frame.kind == FrameKind::Res && frame.id.as_deref() == Some(CONNECT_ID) {
                        return Ok(frame);
                    }
                }
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .map_err(|_| GatewayError::HandshakeTimeout("connect response"))?
}

// ── Read loop ────────────────────────────────────────────────────

/// Demultiplex `res` frames to their waiting callers; everything else is
/// logged and dropped. On stream end the session is marked disconnected and
/// all waiters are woken with a closed channel.
async fn read_loop(mut stream: WsSource, pending: PendingMap, status: Arc<StdRwLock<ConnectionStatus>>) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let frame: Frame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::debug!(error = %e, "Dropping unparseable gateway frame");
                        continue;
                    }
                };
                match frame.kind {
                    FrameKind::Res => {
                        let Some(id) = frame.id.clone() else {
                            tracing::debug!("Dropping res frame without id");
                            continue;
                        };
                        let waiter = pending
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(frame);
                            }
                            // Caller already timed out; drop the late reply.
                            None => tracing::debug!(id = %id, "Dropping late gateway reply"),
                        }
                    }
                    FrameKind::Event => {
                        tracing::debug!(
                            event = frame.event.as_deref().unwrap_or("<unnamed>"),
                            "Ignoring gateway event"
                        );
                    }
                    FrameKind::Req => {
                        tracing::debug!("Ignoring unexpected req frame from gateway");
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "Gateway read error");
                break;
            }
        }
    }

    *status.write().unwrap_or_else(|e| e.into_inner()) = ConnectionStatus::Disconnected;
    // Wake every in-flight caller with a closed channel.
    pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    tracing::info!("Gateway session closed");
}
