//! Tests for the HTTP operations and the token-exchange flow, against a
//! mocked Statehost API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use statehost_client::token::TokenCallback;
use statehost_client::{
    Client, ClientConfig, ClientError, ExchangeConfig, InstanceObserver, TokenConfig,
    TokenProvider,
};

fn client_for(server: &MockServer) -> Client {
    let mut config = ClientConfig::new(TokenConfig::Static("test-token".into()));
    config.api_host = server.uri();
    Client::new(config).unwrap()
}

#[tokio::test]
async fn test_get_instance() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/machines/orders/i/order-17"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "state": {"processing": "payment"},
            "publicContext": {"total": 42},
            "tags": ["active"],
            "done": false,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let snapshot = client.get_instance("orders", "order-17").await.unwrap();
    assert!(snapshot.matches(&"processing.payment".into()));
    assert!(snapshot.has_tag("active"));
    assert!(!snapshot.done);
}

#[tokio::test]
async fn test_create_instance_sends_slug_and_context() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/machines/orders"))
        .and(body_json(json!({
            "slug": "order-18",
            "context": {"customer": "c-9"},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "state": "created",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let context = json!({"customer": "c-9"});
    let snapshot = client
        .create_instance("orders", "order-18", Some(&context))
        .await
        .unwrap();
    assert!(snapshot.matches(&"created".into()));
}

#[tokio::test]
async fn test_send_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/machines/orders/i/order-17/events"))
        .and(body_json(json!({"event": {"type": "approve"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "state": "approved",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let snapshot = client
        .send_event("orders", "order-17", &json!({"type": "approve"}))
        .await
        .unwrap();
    assert!(snapshot.matches(&"approved".into()));
}

#[tokio::test]
async fn test_forbidden_maps_to_authorization_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/machines/orders/i/order-17"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let error = client.get_instance("orders", "order-17").await.unwrap_err();
    assert!(matches!(error, ClientError::Authorization(_)));
}

#[tokio::test]
async fn test_api_error_carries_status_and_code() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/machines/orders/i/missing"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"code": "instance-not-found"})),
        )
        .mount(&server)
        .await;

    let client = client_for(&server);
    let error = client.get_instance("orders", "missing").await.unwrap_err();
    match error {
        ClientError::Api { status, code } => {
            assert_eq!(status, 404);
            assert_eq!(code, "instance-not-found");
        }
        other => panic!("expected an API error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_token_exchange_flow() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tokens"))
        .and(body_json(json!({
            "orgId": "org-1",
            "service": "auth0",
            "token": "identity-token",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "service-token",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let identity: TokenCallback =
        Arc::new(|| async { Ok("identity-token".to_string()) }.boxed());
    let provider = TokenProvider::new(
        TokenConfig::Exchange(ExchangeConfig {
            org_id: "org-1".into(),
            service: "auth0".into(),
            identity_token: identity,
            token_url: None,
        }),
        reqwest::Client::new(),
        &server.uri(),
    );

    // Opaque tokens carry no expiry, so the second call hits the cache
    assert_eq!(provider.get_token().await.unwrap(), "service-token");
    assert_eq!(provider.get_token().await.unwrap(), "service-token");
}

#[tokio::test]
async fn test_token_exchange_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tokens"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let identity: TokenCallback =
        Arc::new(|| async { Ok("identity-token".to_string()) }.boxed());
    let provider = TokenProvider::new(
        TokenConfig::Exchange(ExchangeConfig {
            org_id: "org-1".into(),
            service: "auth0".into(),
            identity_token: identity,
            token_url: None,
        }),
        reqwest::Client::new(),
        &server.uri(),
    );

    let error = provider.get_token().await.unwrap_err();
    assert!(matches!(error, ClientError::Authorization(_)));
}

#[tokio::test]
async fn test_actor_send_records_in_flight_and_routes_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/machines/orders/i/order-17/events"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let mut config = ClientConfig::new(TokenConfig::Static("test-token".into()));
    config.api_host = server.uri();
    // The realtime endpoint here is not a WebSocket server; keep the
    // reconnect loop quiet for the duration of the test.
    config.realtime.reconnect_delay = Duration::from_millis(200);
    let client = Client::new(config).unwrap();

    let actor = client.instance_actor("orders", "order-17");
    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let observer = actor.subscribe(
        InstanceObserver::new(|_| {}).with_error(move |error| {
            sink.lock().unwrap().push(error.to_string());
        }),
    );

    actor.send(json!({"type": "approve"})).await;

    // The event stays in flight until an update arrives; the rejection
    // reaches the observer's error channel instead of a return value.
    assert_eq!(actor.in_flight_events(), vec![json!({"type": "approve"})]);
    assert_eq!(errors.lock().unwrap().len(), 1);

    observer.unsubscribe();
}
