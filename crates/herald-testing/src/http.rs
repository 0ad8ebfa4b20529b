//! Mock chat webhook for delivery tests.

use std::time::Duration;

use serde_json::Value;
use wiremock::{
    matchers::{body_string_contains, method, path},
    Mock, MockServer, Request, ResponseTemplate,
};

/// Wiremock server standing in for a chat service's incoming webhooks.
///
/// Each hook lives under `/services/{name}` so one server can play several
/// targets at once.
pub struct MockWebhook {
    server: MockServer,
}

impl MockWebhook {
    /// Starts a server on a random port.
    pub async fn start() -> Self {
        Self { server: MockServer::start().await }
    }

    /// Base URL of the server.
    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Full URL of a named hook.
    pub fn hook_url(&self, name: &str) -> String {
        format!("{}{}", self.server.uri(), hook_path(name))
    }

    /// Underlying wiremock server for custom expectations.
    pub fn server(&self) -> &MockServer {
        &self.server
    }

    /// Answers every POST to the hook with `status`.
    pub async fn respond_with(&self, name: &str, status: u16) {
        Mock::given(method("POST"))
            .and(path(hook_path(name)))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Answers successive POSTs with the given statuses; the last one repeats.
    pub async fn respond_in_sequence(&self, name: &str, statuses: &[u16]) {
        let Some((last, leading)) = statuses.split_last() else {
            return;
        };

        for status in leading {
            Mock::given(method("POST"))
                .and(path(hook_path(name)))
                .respond_with(ResponseTemplate::new(*status))
                .up_to_n_times(1)
                .mount(&self.server)
                .await;
        }
        self.respond_with(name, *last).await;
    }

    /// Answers POSTs whose body contains `needle` with `status`, `times`
    /// times. Mount before broader mocks for the same hook.
    pub async fn respond_to_body(&self, name: &str, needle: &str, status: u16, times: u64) {
        Mock::given(method("POST"))
            .and(path(hook_path(name)))
            .and(body_string_contains(needle))
            .respond_with(ResponseTemplate::new(status))
            .up_to_n_times(times)
            .mount(&self.server)
            .await;
    }

    /// Answers the next POST with 429 and a `Retry-After` in seconds.
    pub async fn rate_limit_once(&self, name: &str, retry_after_seconds: u64) {
        Mock::given(method("POST"))
            .and(path(hook_path(name)))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", retry_after_seconds.to_string()),
            )
            .up_to_n_times(1)
            .mount(&self.server)
            .await;
    }

    /// Answers every POST to the hook with 200 after `delay`.
    pub async fn respond_slowly(&self, name: &str, delay: Duration) {
        Mock::given(method("POST"))
            .and(path(hook_path(name)))
            .respond_with(ResponseTemplate::new(200).set_delay(delay))
            .mount(&self.server)
            .await;
    }

    /// Requests received by a hook, in arrival order.
    pub async fn requests(&self, name: &str) -> Vec<Request> {
        let hook = hook_path(name);
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.url.path() == hook)
            .collect()
    }

    /// Number of requests received by a hook.
    pub async fn request_count(&self, name: &str) -> usize {
        self.requests(name).await.len()
    }

    /// `text` field of every body posted to a hook, in arrival order.
    pub async fn posted_texts(&self, name: &str) -> Vec<String> {
        self.requests(name)
            .await
            .iter()
            .filter_map(|request| serde_json::from_slice::<Value>(&request.body).ok())
            .filter_map(|body| body.get("text").and_then(Value::as_str).map(str::to_owned))
            .collect()
    }
}

fn hook_path(name: &str) -> String {
    format!("/services/{name}")
}
