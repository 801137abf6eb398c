#![allow(clippy::unwrap_used)]
// End-to-end tests for `DispatchConsole`: REST bulk loads against wiremock,
// push events through a channel-backed connector.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dispatch_api::{DispatchClient, RawMessage, StreamConnector, StreamSignal};
use dispatch_core::{ConnectionState, ConsoleConfig, DispatchConsole, Position};

// ── Helpers ─────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeConnector {
    senders: Mutex<Vec<mpsc::Sender<StreamSignal>>>,
}

impl FakeConnector {
    fn latest(&self) -> mpsc::Sender<StreamSignal> {
        self.senders.lock().unwrap().last().cloned().unwrap()
    }

    fn opened(&self) -> usize {
        self.senders.lock().unwrap().len()
    }
}

impl StreamConnector for FakeConnector {
    fn open(&self, _token: &SecretString, _cancel: CancellationToken) -> mpsc::Receiver<StreamSignal> {
        let (tx, rx) = mpsc::channel(64);
        self.senders.lock().unwrap().push(tx);
        rx
    }
}

fn message(event_type: &str, data: serde_json::Value) -> StreamSignal {
    StreamSignal::Message(RawMessage {
        event_type: Some(event_type.into()),
        data: data.to_string(),
        id: None,
    })
}

fn token() -> SecretString {
    SecretString::from("session-token".to_string())
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

async fn mock_list(server: &MockServer, resource: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!("/api/{resource}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mock_defaults(server: &MockServer) {
    mock_list(
        server,
        "incidents",
        json!([
            { "id": "I1", "status": "open", "label": "Fire" },
            { "id": "I2", "status": "open", "label": "Flood" }
        ]),
    )
    .await;
    mock_list(
        server,
        "vehicles",
        json!({ "data": [
            { "id": "v1", "immatriculation": "AB-123-CD", "lat": 45.0, "lng": 4.0, "status": "available" }
        ]}),
    )
    .await;
    mock_list(
        server,
        "proposals",
        json!([{ "proposal_id": "P1", "incident_id": "I1", "items": [
            { "vehicle_id": "v1", "phase_id": "p1", "score": 0.9 }
        ]}]),
    )
    .await;
}

fn console(server: &MockServer) -> (DispatchConsole, Arc<FakeConnector>) {
    let base_url = Url::parse(&server.uri()).unwrap();
    let mut config = ConsoleConfig::new(base_url.clone());
    config.debounce = Duration::from_millis(20);
    let client = DispatchClient::with_client(reqwest::Client::new(), base_url);
    let connector = Arc::new(FakeConnector::default());
    let console = DispatchConsole::new(config, client, connector.clone());
    (console, connector)
}

// ── Mount ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_mount_loads_collections_and_opens_stream() {
    let server = MockServer::start().await;
    mock_defaults(&server).await;
    let (console, connector) = console(&server);

    let report = console.mount(&token()).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.incidents, Some(2));
    assert_eq!(report.vehicles, Some(1));
    assert_eq!(report.proposals, Some(1));
    assert_eq!(connector.opened(), 1);
    assert_eq!(console.stream().handler_count("vehicle_position_update"), 1);
    assert_eq!(console.proposals().pending().len(), 1);

    connector.latest().send(StreamSignal::Opened).await.unwrap();
    wait_for(|| console.stream().attached_names().len() == 7).await;

    let incidents = console.incidents().clone();
    wait_for(|| incidents.snapshot().len() == 2).await;
    assert!(console.take_warnings().is_empty());
}

#[tokio::test]
async fn test_failed_load_degrades_without_blocking_others() {
    let server = MockServer::start().await;
    mock_list(&server, "incidents", json!([{ "id": "I1" }])).await;
    mock_list(&server, "proposals", json!([])).await;
    Mock::given(method("GET"))
        .and(path("/api/vehicles"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;
    let (console, _connector) = console(&server);

    let report = console.mount(&token()).await.unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.incidents, Some(1));
    assert_eq!(report.vehicles, None);
    assert!(console.vehicles().is_empty());

    let warnings = console.take_warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].starts_with("vehicles:"));
    assert!(console.take_warnings().is_empty());
}

// ── Live updates ────────────────────────────────────────────────────

#[tokio::test]
async fn test_stream_events_reach_the_stores() {
    let server = MockServer::start().await;
    mock_defaults(&server).await;
    let (console, connector) = console(&server);
    console.mount(&token()).await.unwrap();

    let tx = connector.latest();
    tx.send(StreamSignal::Opened).await.unwrap();
    tx.send(message(
        "vehicle_position_update",
        json!({ "immatriculation": "AB-123-CD", "latitude": 45.5, "longitude": 4.5 }),
    ))
    .await
    .unwrap();
    tx.send(message(
        "incident_status_update",
        json!({ "incident_id": "I2", "status": "closed" }),
    ))
    .await
    .unwrap();
    tx.send(message(
        "assignment_proposal",
        json!({ "proposal_id": "P1", "validated_at": "2026-03-01T10:00:00Z" }),
    ))
    .await
    .unwrap();

    let vehicles = console.vehicles().clone();
    wait_for(|| {
        vehicles
            .snapshot()
            .first()
            .and_then(|v| v.position())
            == Some(Position::new(45.5, 4.5))
    })
    .await;

    let incidents = console.incidents().clone();
    wait_for(|| {
        incidents
            .snapshot()
            .iter()
            .any(|i| i.id == "I2" && i.status.as_deref() == Some("closed"))
    })
    .await;

    wait_for(|| console.proposals().pending().is_empty()).await;
    assert_eq!(console.stream_status().state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_positions_track_loaded_vehicles() {
    let server = MockServer::start().await;
    mock_defaults(&server).await;
    let (console, _connector) = console(&server);
    assert!(console.positions().is_empty());

    console.mount(&token()).await.unwrap();

    wait_for(|| console.positions().get("v1") == Some(&Position::new(45.0, 4.0))).await;
    assert!(console.watch_positions().is_some());
}

// ── References ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_references_resolve_through_the_client() {
    let server = MockServer::start().await;
    mock_defaults(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/references/stations"))
        .and(query_param("ids", "s1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "s1": { "label": "Station Nord" } })),
        )
        .expect(1)
        .mount(&server)
        .await;
    let (console, _connector) = console(&server);

    assert_eq!(console.references().resolve_label("stations", "s1"), None);
    wait_for(|| console.references().resolve_label("stations", "s1").is_some()).await;
    assert_eq!(
        console.references().resolve_label("stations", "s1").as_deref(),
        Some("Station Nord")
    );
}

// ── Re-authentication ───────────────────────────────────────────────

#[tokio::test]
async fn test_new_session_token_reaches_rest_calls() {
    let server = MockServer::start().await;
    for resource in ["incidents", "vehicles", "proposals"] {
        Mock::given(method("GET"))
            .and(path(format!("/api/{resource}")))
            .and(header("authorization", "Bearer rotated-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/api/references/stations"))
        .and(header("authorization", "Bearer rotated-token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "s1": { "label": "Station Nord" } })),
        )
        .expect(1)
        .mount(&server)
        .await;
    let (console, connector) = console(&server);

    let before = console.refresh().await;
    assert_eq!(before.incidents, None);

    let rotated = SecretString::from("rotated-token".to_string());
    console.set_session(Some(&rotated));
    assert_eq!(connector.opened(), 1);

    let after = console.refresh().await;
    assert!(after.is_complete());
    assert_eq!(after.incidents, Some(0));

    assert_eq!(console.references().resolve_label("stations", "s1"), None);
    wait_for(|| console.references().resolve_label("stations", "s1").is_some()).await;
}

// ── Teardown ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_teardown_stops_everything() {
    let server = MockServer::start().await;
    mock_defaults(&server).await;
    let (console, connector) = console(&server);
    console.mount(&token()).await.unwrap();
    connector.latest().send(StreamSignal::Opened).await.unwrap();
    wait_for(|| console.stream().is_connected()).await;

    console.teardown();
    console.teardown();

    assert!(console.is_torn_down());
    assert!(console.stream().attached_names().is_empty());
    assert_eq!(console.stream_status().state, ConnectionState::Disconnected);
    assert!(console.mount(&token()).await.is_err());

    console.set_session(Some(&token()));
    assert_eq!(connector.opened(), 1);
}
