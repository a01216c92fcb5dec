//! Shared fixtures for unit tests.

use crate::auth::{self, Credentials, SessionManager};
use crate::session::Session;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub(crate) const TEST_PRIVATE_KEY: &[u8] = include_bytes!("../tests/fixtures/test_rsa_private.pem");
pub(crate) const TEST_PUBLIC_KEY: &[u8] = include_bytes!("../tests/fixtures/test_rsa_public.pem");

pub(crate) const TOKEN_PATH: &str = "/services/oauth2/token";
pub(crate) const API_VERSION: &str = "65.0";

pub(crate) fn credentials(token_url: &str) -> Credentials {
    Credentials {
        client_id: "test_client_id".to_string(),
        username: "integration@example.com".to_string(),
        token_url: token_url.to_string(),
        audience: None,
        private_key_path: Some(PathBuf::from("tests/fixtures/test_rsa_private.pem")),
    }
}

pub(crate) fn manager(server: &MockServer) -> SessionManager {
    auth::Builder::new()
        .credentials(credentials(&format!("{}{TOKEN_PATH}", server.uri())))
        .private_key_pem(TEST_PRIVATE_KEY.to_vec())
        .request_timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

pub(crate) async fn mount_token(server: &MockServer, access_token: &str) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": access_token,
            "instance_url": server.uri(),
            "token_type": "Bearer"
        })))
        .mount(server)
        .await;
}

pub(crate) async fn mount_versions(server: &MockServer, versions: &[&str]) {
    let listing: Vec<Value> = versions
        .iter()
        .map(|v| json!({ "version": v, "label": "Release", "url": format!("/services/data/v{v}") }))
        .collect();
    Mock::given(method("GET"))
        .and(path("/services/data/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing))
        .mount(server)
        .await;
}

pub(crate) fn session(instance_url: &str, token: &str, lifetime: Duration) -> Session {
    let now = SystemTime::now();
    Session::new(token, instance_url, API_VERSION, now, now + lifetime).unwrap()
}

pub(crate) fn expired_session(instance_url: &str) -> Session {
    let now = SystemTime::now();
    Session::new(
        "expired",
        instance_url,
        API_VERSION,
        now - Duration::from_secs(7200),
        now - Duration::from_secs(3600),
    )
    .unwrap()
}

/// Analytics report payload with one detail column and `labels` as rows in
/// the `T!T` bucket.
pub(crate) fn report_page(labels: &[&str], page_token: Option<&str>) -> Value {
    let rows: Vec<Value> = labels
        .iter()
        .map(|label| json!({ "dataCells": [{ "label": label, "value": label }] }))
        .collect();
    let mut page = json!({
        "reportMetadata": { "detailColumns": ["ACCOUNT.NAME"] },
        "reportExtendedMetadata": {
            "detailColumnInfo": { "ACCOUNT.NAME": { "label": "Account Name", "dataType": "string" } }
        },
        "factMap": { "T!T": { "rows": rows, "aggregates": [{ "label": labels.len().to_string() }] } },
        "allData": page_token.is_none()
    });
    if let Some(token) = page_token {
        page["pageToken"] = json!(token);
    }
    page
}

pub(crate) fn report_path(report_id: &str) -> String {
    format!("/services/data/v{API_VERSION}/analytics/reports/{report_id}")
}

pub(crate) fn jobs_path() -> String {
    format!("/services/data/v{API_VERSION}/jobs/query")
}

/// An event recorded by [`EventCapture`]: its level and `field = value` pairs,
/// including `message`.
#[derive(Debug, Clone)]
pub(crate) struct CapturedEvent {
    pub(crate) level: tracing::Level,
    pub(crate) fields: HashMap<String, String>,
}

/// Layer that records every event emitted while it is the default subscriber.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventCapture(Arc<Mutex<Vec<CapturedEvent>>>);

impl EventCapture {
    /// Installs a capture for the current thread. Events stop being recorded
    /// once the guard is dropped.
    pub(crate) fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        (capture, tracing::subscriber::set_default(subscriber))
    }

    pub(crate) fn events(&self) -> Vec<CapturedEvent> {
        self.0.lock().unwrap().clone()
    }
}

impl<S: Subscriber> Layer<S> for EventCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor(HashMap::new());
        event.record(&mut visitor);
        self.0.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            fields: visitor.0,
        });
    }
}

struct FieldVisitor(HashMap<String, String>);

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }
}
