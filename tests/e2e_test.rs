//! End-to-end tests through the HTTP API, the SQLite settings store, the
//! notifier and a mock chat webhook.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use axum::{body::Body, Router};
use herald_api::{create_router, AppState};
use herald_core::{storage::Storage, Clock, DeliveryStatus, SettingsStore};
use herald_delivery::{event_channel, Notifier};
use herald_testing::{MockWebhook, RecordingHandler, TestClock, TestEnv};
use http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tower::ServiceExt;
use wiremock::{
    matchers::{body_partial_json, header as header_matcher, method, path},
    Mock, ResponseTemplate,
};

struct Service {
    app: Router,
    notifier: Notifier,
    recorder: Arc<RecordingHandler>,
    intake: JoinHandle<()>,
}

impl Service {
    async fn start() -> Self {
        let storage = Storage::connect("sqlite::memory:", 1).await.unwrap();
        storage.migrate().await.unwrap();
        let settings: Arc<dyn SettingsStore> = storage.slack_settings.clone();
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let recorder = Arc::new(RecordingHandler::new());

        let notifier = Notifier::with_outcome_handler(
            TestEnv::config(),
            settings.clone(),
            clock.clone(),
            recorder.clone(),
        )
        .unwrap();
        let (publisher, events) = event_channel(32);
        let intake = tokio::spawn({
            let notifier = notifier.clone();
            async move { notifier.run(events).await }
        });

        let app = create_router(AppState::new(settings, publisher, notifier.clone(), clock));
        Self { app, notifier, recorder, intake }
    }

    async fn call(&self, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn stop(self) {
        self.notifier.shutdown().await.unwrap();
        self.intake.await.unwrap();
    }
}

fn push(actor: &str) -> Value {
    json!({
        "event_type": "push",
        "payload": {
            "actor": actor,
            "ref_changes": [{
                "ref_id": "refs/heads/main",
                "from_hash": "0123456789abcdef",
                "to_hash": "fedcba9876543210",
                "kind": "update",
            }],
        },
    })
}

#[tokio::test]
async fn disabling_notifications_stops_further_posts() {
    let webhook = MockWebhook::start().await;
    Mock::given(method("POST"))
        .and(path("/services/abc"))
        .and(header_matcher("content-type", "application/json"))
        .and(body_partial_json(json!({"text": "alice pushed to `main` in PROJ/web"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(webhook.server())
        .await;
    let service = Service::start().await;

    let (status, _) = service
        .call(
            "PUT",
            "/settings/PROJ/web",
            json!({"enabled": true, "enabled_for_push": true, "webhook_url": webhook.hook_url("abc")}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = service.call("POST", "/events/PROJ/web", push("alice")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    service.recorder.wait_for(1).await;
    assert_eq!(service.recorder.statuses().await, [DeliveryStatus::Delivered]);

    let (status, _) = service
        .call("PUT", "/settings/PROJ/web", json!({"enabled": false, "webhook_url": null}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = service.call("POST", "/events/PROJ/web", push("bob")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    service.recorder.wait_for(2).await;
    service.notifier.wait_idle().await;

    assert_eq!(webhook.request_count("abc").await, 1);
    let stats = service.notifier.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.filtered, 1);

    service.stop().await;
}

#[tokio::test]
async fn rejected_settings_keep_previous_value_in_database() {
    let webhook = MockWebhook::start().await;
    let service = Service::start().await;
    let hook = webhook.hook_url("abc");

    service
        .call(
            "PUT",
            "/settings/PROJ/web",
            json!({"enabled": true, "enabled_for_push": false, "webhook_url": hook}),
        )
        .await;

    let (status, body) = service
        .call("PUT", "/settings/PROJ/web", json!({"enabled": true, "webhook_url": "not a url"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "E1001");

    let request = Request::builder().uri("/settings/PROJ/web").body(Body::empty()).unwrap();
    let response = service.app.clone().oneshot(request).await.unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let stored: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(stored, json!({"enabled": true, "enabled_for_push": false, "webhook_url": hook}));

    service.stop().await;
}

#[tokio::test]
async fn pull_request_is_posted_when_push_is_muted() {
    let webhook = MockWebhook::start().await;
    webhook.respond_with("abc", 200).await;
    let service = Service::start().await;

    service
        .call(
            "PUT",
            "/settings/PROJ/web",
            json!({"enabled": true, "enabled_for_push": false, "webhook_url": webhook.hook_url("abc")}),
        )
        .await;

    service.call("POST", "/events/PROJ/web", push("alice")).await;
    let (status, _) = service
        .call(
            "POST",
            "/events/PROJ/web",
            json!({
                "event_type": "pull_request_merged",
                "payload": {
                    "actor": "carol",
                    "pull_request": {
                        "id": 7,
                        "title": "Add retries",
                        "from_branch": "feature/retries",
                        "to_branch": "main",
                    },
                },
            }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    service.recorder.wait_for(2).await;
    service.notifier.wait_idle().await;

    let texts = webhook.posted_texts("abc").await;
    assert_eq!(texts, ["carol merged pull request #7 in PROJ/web"]);

    service.stop().await;
}
