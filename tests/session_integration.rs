//! End-to-end session tests: a real hub server, a scripted agent client
//!
//! These spin the hub router on an ephemeral port, register a system over
//! the admin API, connect a WebSocket client that behaves like an agent,
//! and drive the sampling path through the live session registry.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use lightspeed::config::HubSettings;
use lightspeed::domain::{CombinedData, PingEntry, PingResult, Stats, SystemInfo};
use lightspeed::domain_types::SystemId;
use lightspeed::hub::Hub;
use lightspeed::hub::alerts::{LogNotifier, SharedNotifier};
use lightspeed::hub::api::HubState;
use lightspeed::storage::sqlite::SqliteRepository;
use lightspeed::storage::{Repository, SharedRepository};
use lightspeed::time_provider::system_clock;
use lightspeed::wire::{ControlFrame, encode_combined};

fn test_settings() -> HubSettings {
    HubSettings {
        app_url: "http://localhost".to_string(),
        listen: "127.0.0.1:0".to_string(),
        database: ":memory:".to_string(),
        key: String::new(),
        admin_token: None,
        disable_password_auth: false,
        user_creation: false,
        csp: None,
        retention_days: 30,
        alerts_history_keep: 200,
    }
}

async fn start_hub() -> (SocketAddr, HubState, Hub) {
    let repo: SharedRepository = Arc::new(SqliteRepository::open_in_memory().await.unwrap());
    let notifier: SharedNotifier = Arc::new(LogNotifier);
    let hub = Hub::new(test_settings(), repo, notifier, system_clock());
    let router = hub.start().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = hub.state().clone();
    tokio::spawn(axum::serve(listener, router).into_future());
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, state, hub)
}

async fn register_system(addr: SocketAddr) -> (SystemId, String) {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/api/beszel/systems"))
        .json(&serde_json::json!({"name": "sys1", "host": "sys1.example.org"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    let body: serde_json::Value = response.json().await.unwrap();
    let id = SystemId::try_new(body["id"].as_str().unwrap().to_string()).unwrap();
    (id, body["token"].as_str().unwrap().to_string())
}

fn agent_request(
    addr: SocketAddr,
    token: &str,
    version: &str,
    fingerprint: &str,
) -> tokio_tungstenite::tungstenite::handshake::client::Request {
    let mut request = format!("ws://{addr}/api/beszel/agent-connect")
        .into_client_request()
        .unwrap();
    let headers = request.headers_mut();
    headers.insert("X-Token", HeaderValue::from_str(token).unwrap());
    headers.insert("X-Beszel", HeaderValue::from_str(version).unwrap());
    headers.insert("X-Fingerprint", HeaderValue::from_str(fingerprint).unwrap());
    request
}

fn sample_snapshot() -> CombinedData {
    CombinedData {
        stats: Stats {
            ping: vec![PingEntry {
                host: "8.8.8.8".to_string(),
                result: PingResult {
                    packet_loss: 0.0,
                    min_rtt: 9.1,
                    avg_rtt: 9.5,
                    max_rtt: 9.9,
                    last_checked: chrono::Utc::now(),
                },
            }],
            ..Default::default()
        },
        info: SystemInfo {
            hostname: "sys1".to_string(),
            version: "0.5.0".to_string(),
            ..Default::default()
        },
    }
}

/// Runs a scripted agent: answers pings with pongs and data requests with
/// the given snapshot, until the hub closes.
async fn run_scripted_agent(
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    snapshot: CombinedData,
) -> Option<String> {
    let (mut sink, mut stream) = socket.split();
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match ControlFrame::from_json(&text).unwrap() {
                ControlFrame::DataRequest => {
                    let payload = encode_combined(&snapshot).unwrap();
                    sink.send(Message::Binary(payload.into())).await.unwrap();
                }
                ControlFrame::Ping => {
                    sink.send(Message::Text(ControlFrame::Pong.to_json().unwrap().into()))
                        .await
                        .unwrap();
                }
                ControlFrame::Close { reason } => return Some(reason),
                _ => {}
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

#[tokio::test]
async fn first_run_flips_after_registration() {
    let (addr, _state, _hub) = start_hub().await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/api/beszel/first-run");

    let body: serde_json::Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["firstRun"], true);

    register_system(addr).await;
    let body: serde_json::Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["firstRun"], false);
}

#[test_log::test(tokio::test)]
async fn agent_connects_and_hub_samples_it() {
    let (addr, state, _hub) = start_hub().await;
    let (system, token) = register_system(addr).await;

    let (socket, _) = connect_async(agent_request(addr, &token, "0.5.0", "fp-1"))
        .await
        .unwrap();
    tokio::spawn(run_scripted_agent(socket, sample_snapshot()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let session = state.sessions.get(&system).expect("session registered");
    assert_eq!(session.agent_version(), "0.5.0");

    let data = session.sample().await.unwrap();
    assert_eq!(data.info.version, "0.5.0");
    assert_eq!(data.stats.ping[0].result.avg_rtt, 9.5);

    // Responses stay FIFO under repeated requests.
    for _ in 0..3 {
        assert!(session.sample().await.is_ok());
    }
}

#[tokio::test]
async fn handshake_rejects_unknown_token_and_bad_version() {
    let (addr, _state, _hub) = start_hub().await;

    let denied = connect_async(agent_request(addr, "no-such-token", "0.5.0", "fp-1")).await;
    assert!(denied.is_err(), "unknown token must be rejected");

    let (_, token) = register_system(addr).await;
    let denied = connect_async(agent_request(addr, &token, "not-semver", "fp-1")).await;
    assert!(denied.is_err(), "malformed version must be rejected");
}

#[tokio::test]
async fn fingerprint_binds_on_first_connect_and_then_pins() {
    let (addr, state, _hub) = start_hub().await;
    let (system, token) = register_system(addr).await;

    let (socket, _) = connect_async(agent_request(addr, &token, "0.5.0", "fp-original"))
        .await
        .unwrap();
    tokio::spawn(run_scripted_agent(socket, sample_snapshot()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let bound = state.repo.get_fingerprint(&system).await.unwrap();
    assert_eq!(bound.fingerprint.unwrap().to_string(), "fp-original");

    // A different identity on the same token is refused.
    let denied = connect_async(agent_request(addr, &token, "0.5.0", "fp-imposter")).await;
    assert!(denied.is_err());
}

#[test_log::test(tokio::test)]
async fn token_rotation_closes_the_live_session() {
    let (addr, state, _hub) = start_hub().await;
    let (system, token) = register_system(addr).await;

    let (socket, _) = connect_async(agent_request(addr, &token, "0.5.0", "fp-1"))
        .await
        .unwrap();
    let agent_task = tokio::spawn(run_scripted_agent(socket, sample_snapshot()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(state.sessions.get(&system).is_some());

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/api/beszel/systems/{system}/rotate-token"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        state.sessions.get(&system).is_none(),
        "session must be gone after rotation"
    );
    let close_reason = agent_task.await.unwrap();
    assert_eq!(close_reason.as_deref(), Some("token rotated"));

    // The old token no longer authenticates.
    let denied = connect_async(agent_request(addr, &token, "0.5.0", "fp-1")).await;
    assert!(denied.is_err());
}

#[tokio::test]
async fn stored_config_is_pushed_once_on_first_connect() {
    let (addr, _state, _hub) = start_hub().await;
    let (system, token) = register_system(addr).await;

    let client = reqwest::Client::new();
    let response = client
        .put(format!("http://{addr}/api/beszel/systems/{system}/config"))
        .json(&serde_json::json!({
            "ping": {
                "enabled": true,
                "targets": [{"host": "8.8.8.8", "count": 3, "timeout": "1s"}],
                "interval": "*/1 * * * *"
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["version"].as_i64().unwrap() > 0);

    let (socket, _) = connect_async(agent_request(addr, &token, "0.5.0", "fp-1"))
        .await
        .unwrap();
    let (config_tx, mut config_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (mut sink, mut stream) = socket.split();
        while let Some(Ok(message)) = stream.next().await {
            if let Message::Text(text) = message {
                match ControlFrame::from_json(&text).unwrap() {
                    ControlFrame::Config(pushed) => {
                        let _ = config_tx.send(pushed);
                    }
                    ControlFrame::Ping => {
                        sink.send(Message::Text(ControlFrame::Pong.to_json().unwrap().into()))
                            .await
                            .unwrap();
                    }
                    _ => {}
                }
            }
        }
    });

    let pushed = tokio::time::timeout(Duration::from_secs(2), config_rx.recv())
        .await
        .expect("config frame within the deadline")
        .expect("channel open");
    assert_eq!(pushed.config.ping.targets[0].host, "8.8.8.8");
    assert_eq!(pushed.version.as_i64(), body["version"].as_i64().unwrap());

    // No second initial push arrives for the same registration.
    let again = tokio::time::timeout(Duration::from_millis(300), config_rx.recv()).await;
    assert!(again.is_err(), "initial config must be delivered at most once");
}

#[tokio::test]
async fn superseding_connection_closes_the_previous_session() {
    let (addr, state, _hub) = start_hub().await;
    let (system, token) = register_system(addr).await;

    let (first, _) = connect_async(agent_request(addr, &token, "0.5.0", "fp-1"))
        .await
        .unwrap();
    let first_task = tokio::spawn(run_scripted_agent(first, sample_snapshot()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (second, _) = connect_async(agent_request(addr, &token, "0.5.0", "fp-1"))
        .await
        .unwrap();
    tokio::spawn(run_scripted_agent(second, sample_snapshot()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Exactly one live session for the system.
    assert_eq!(state.sessions.len(), 1);
    let reason = first_task.await.unwrap();
    assert_eq!(reason.as_deref(), Some("superseded by new connection"));
    assert!(state.sessions.get(&system).unwrap().sample().await.is_ok());
}
