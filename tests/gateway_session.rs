//! End-to-end tests for the gateway RPC client.
//!
//! These start a real WebSocket server on a random port that speaks the
//! gateway frame protocol: it issues the `connect.challenge` nonce, verifies
//! the device signature on the connect request, and serves config/pairing
//! calls. The error-classification paths are driven with the same free-text
//! messages a live gateway produces.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use keywarden::gateway::{ConnectionStatus, GatewayConfig, GatewayError, GatewayRpcClient};

const NONCE: &str = "nonce-integration-1";
const TOKEN: &str = "shared-secret-token";

#[derive(Clone, Copy, PartialEq)]
enum ServerMode {
    Accept,
    RejectPairing,
    RejectToken,
    RateLimitConfig,
    LockConfig,
    CloseAfterConnect,
}

async fn spawn_gateway(mode: ServerMode) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle_connection(stream, mode));
        }
    });
    addr
}

async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("server send failed");
}

async fn recv_json(ws: &mut WebSocketStream<TcpStream>) -> Option<Value> {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn send_ok(ws: &mut WebSocketStream<TcpStream>, id: &str, payload: Value) {
    send_json(
        ws,
        json!({"type": "res", "id": id, "ok": true, "payload": payload}),
    )
    .await;
}

async fn send_error(ws: &mut WebSocketStream<TcpStream>, id: &str, message: &str, payload: Value) {
    send_json(
        ws,
        json!({
            "type": "res", "id": id, "ok": false,
            "error": {"code": "E", "message": message},
            "payload": payload,
        }),
    )
    .await;
}

/// Rebuild the signed challenge payload from the connect request and verify
/// the Ed25519 signature against the presented public key.
fn verify_device_signature(params: &Value) {
    let device = &params["device"];
    let pk_bytes = URL_SAFE_NO_PAD
        .decode(device["publicKey"].as_str().unwrap())
        .unwrap();
    let pk_arr: [u8; 32] = pk_bytes.clone().try_into().unwrap();
    let vk = VerifyingKey::from_bytes(&pk_arr).unwrap();
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(device["signature"].as_str().unwrap())
        .unwrap();
    let sig_arr: [u8; 64] = sig_bytes.try_into().unwrap();
    let sig = Signature::from_bytes(&sig_arr);

    // Device id must be the SHA-256 hex digest of the public key
    let expected_id: String = Sha256::digest(&pk_bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    assert_eq!(device["id"].as_str().unwrap(), expected_id);
    assert_eq!(device["nonce"].as_str().unwrap(), NONCE);

    let scopes: Vec<String> = params["scopes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s.as_str().unwrap().to_string())
        .collect();
    let payload = [
        "v1",
        expected_id.as_str(),
        params["client"]["id"].as_str().unwrap(),
        params["client"]["mode"].as_str().unwrap(),
        params["role"].as_str().unwrap(),
        &scopes.join(","),
        &device["signedAt"].as_i64().unwrap().to_string(),
        params["auth"]["token"].as_str().unwrap_or(""),
        device["nonce"].as_str().unwrap(),
    ]
    .join("|");

    vk.verify(payload.as_bytes(), &sig)
        .expect("device signature must verify");
}

async fn handle_connection(stream: TcpStream, mode: ServerMode) {
    let mut ws = accept_async(stream).await.unwrap();

    // Unsolicited challenge with the single-use nonce
    send_json(
        &mut ws,
        json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": NONCE}}),
    )
    .await;

    let req = recv_json(&mut ws).await.expect("expected connect request");
    assert_eq!(req["type"], "req");
    assert_eq!(req["method"], "connect");
    assert_eq!(req["id"], "0", "connect uses the reserved correlation id");
    assert_eq!(req["params"]["minProtocol"], 1);
    assert_eq!(req["params"]["auth"]["token"], TOKEN);

    match mode {
        ServerMode::RejectPairing => {
            send_error(
                &mut ws,
                "0",
                "device pairing required; pending approval",
                json!({"requestId": "req-9"}),
            )
            .await;
            return;
        }
        ServerMode::RejectToken => {
            send_error(&mut ws, "0", "auth token mismatch", json!({})).await;
            return;
        }
        _ => {
            verify_device_signature(&req["params"]);
            send_ok(&mut ws, "0", json!({})).await;
        }
    }

    if mode == ServerMode::CloseAfterConnect {
        let _ = ws.close(None).await;
        return;
    }

    let mut hash = "h1".to_string();
    while let Some(req) = recv_json(&mut ws).await {
        let id = req["id"].as_str().unwrap().to_string();
        match req["method"].as_str().unwrap() {
            "config.get" => {
                if mode == ServerMode::RateLimitConfig {
                    send_error(&mut ws, &id, "rate limit exceeded; retry after 30s", json!({}))
                        .await;
                } else {
                    send_ok(&mut ws, &id, json!({"hash": hash})).await;
                }
            }
            "config.patch" => {
                if mode == ServerMode::LockConfig {
                    send_error(
                        &mut ws,
                        &id,
                        "could not acquire config file lock",
                        json!({}),
                    )
                    .await;
                } else {
                    // Optimistic concurrency: stale hashes are rejected
                    if req["params"]["baseHash"] != Value::String(hash.clone()) {
                        send_error(&mut ws, &id, "base hash is stale", json!({})).await;
                        continue;
                    }
                    assert!(req["params"]["restartDelayMs"].is_u64());
                    hash = "h2".to_string();
                    send_ok(&mut ws, &id, json!({"hash": hash})).await;
                }
            }
            "device.pair.list" => {
                send_ok(
                    &mut ws,
                    &id,
                    json!({"devices": [
                        {"requestId": "req-1", "deviceId": "aabb", "status": "pending"},
                        {"deviceId": "ccdd", "status": "paired"},
                    ]}),
                )
                .await;
            }
            "device.pair.approve" | "device.pair.reject" => {
                assert_eq!(req["params"]["requestId"], "req-1");
                send_ok(&mut ws, &id, json!({})).await;
            }
            other => {
                send_error(&mut ws, &id, &format!("unknown method: {other}"), json!({})).await;
            }
        }
    }
}

fn test_client(addr: SocketAddr, dir: &TempDir) -> Arc<GatewayRpcClient> {
    let mut config = GatewayConfig::new(format!("ws://{addr}"), dir.path().join("device.key"));
    config.token = Some(TOKEN.to_string());
    Arc::new(GatewayRpcClient::new(config).unwrap())
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_handshake_and_signed_connect() {
    let addr = spawn_gateway(ServerMode::Accept).await;
    let dir = TempDir::new().unwrap();
    let client = test_client(addr, &dir);

    client.connect().await.unwrap();
    assert!(client.is_connected());
    assert_eq!(client.status(), ConnectionStatus::Connected);

    client.disconnect().await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_patch_config_uses_fetched_hash() {
    let addr = spawn_gateway(ServerMode::Accept).await;
    let dir = TempDir::new().unwrap();
    let client = test_client(addr, &dir);
    client.connect().await.unwrap();

    let new_hash = client
        .patch_config(&json!({"channels": {"gmail": {"token": "w1"}}}), "grant")
        .await
        .unwrap();
    assert_eq!(new_hash, "h2");
}

#[tokio::test]
async fn test_restart_gateway_sends_noop_patch() {
    let addr = spawn_gateway(ServerMode::Accept).await;
    let dir = TempDir::new().unwrap();
    let client = test_client(addr, &dir);
    client.connect().await.unwrap();

    client.restart_gateway("apply env change").await.unwrap();
}

#[tokio::test]
async fn test_device_pairing_operations() {
    let addr = spawn_gateway(ServerMode::Accept).await;
    let dir = TempDir::new().unwrap();
    let client = test_client(addr, &dir);
    client.connect().await.unwrap();

    let devices = client.list_devices().await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].request_id.as_deref(), Some("req-1"));
    assert_eq!(devices[1].status.as_deref(), Some("paired"));

    client.approve_device("req-1").await.unwrap();
    client.reject_device("req-1").await.unwrap();
}

#[tokio::test]
async fn test_pairing_rejection_sets_status_with_request_id() {
    let addr = spawn_gateway(ServerMode::RejectPairing).await;
    let dir = TempDir::new().unwrap();
    let client = test_client(addr, &dir);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, GatewayError::PairingRequired));
    assert_eq!(
        client.status(),
        ConnectionStatus::NeedsPairing {
            request_id: Some("req-9".to_string())
        }
    );
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_token_mismatch_sets_status() {
    let addr = spawn_gateway(ServerMode::RejectToken).await;
    let dir = TempDir::new().unwrap();
    let client = test_client(addr, &dir);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, GatewayError::TokenMismatch));
    assert_eq!(client.status(), ConnectionStatus::TokenMismatch);
}

#[tokio::test]
async fn test_rate_limit_classified_with_retry_after() {
    let addr = spawn_gateway(ServerMode::RateLimitConfig).await;
    let dir = TempDir::new().unwrap();
    let client = test_client(addr, &dir);
    client.connect().await.unwrap();

    let err = client.patch_config(&json!({}), "x").await.unwrap_err();
    match err {
        GatewayError::RateLimited { retry_after } => {
            assert_eq!(retry_after, Duration::from_secs(30));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn test_config_lock_classified_and_not_retried() {
    let addr = spawn_gateway(ServerMode::LockConfig).await;
    let dir = TempDir::new().unwrap();
    let client = test_client(addr, &dir);
    client.connect().await.unwrap();

    let err = client.patch_config(&json!({}), "x").await.unwrap_err();
    assert!(matches!(err, GatewayError::ConfigLocked));
}

#[tokio::test]
async fn test_server_close_marks_disconnected() {
    let addr = spawn_gateway(ServerMode::CloseAfterConnect).await;
    let dir = TempDir::new().unwrap();
    let client = test_client(addr, &dir);
    client.connect().await.unwrap();

    // The read loop observes the close and flips the status.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_calls_require_connection() {
    let dir = TempDir::new().unwrap();
    let config = GatewayConfig::new("ws://127.0.0.1:9", dir.path().join("device.key"));
    let client = GatewayRpcClient::new(config).unwrap();

    let err = client.list_devices().await.unwrap_err();
    assert!(matches!(err, GatewayError::NotConnected));
}

#[tokio::test]
async fn test_reconnect_loop_recovers_session() {
    let addr = spawn_gateway(ServerMode::Accept).await;
    let dir = TempDir::new().unwrap();
    let mut config = GatewayConfig::new(format!("ws://{addr}"), dir.path().join("device.key"));
    config.token = Some(TOKEN.to_string());
    config.reconnect_interval = Duration::from_millis(50);
    let client = Arc::new(GatewayRpcClient::new(config).unwrap());

    let handle = client.spawn_reconnect_loop();
    // Starts disconnected; the loop should bring the session up on its own.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !client.is_connected() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("reconnect loop never connected");

    handle.abort();
    client.disconnect().await;
}
