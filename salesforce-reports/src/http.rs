//! Authorized requests against the versioned REST API.

use crate::auth::{self, SessionManager};
use crate::error::Error;
use crate::session::Session;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

/// Default TCP keepalive for data API connections (60 seconds).
const TCP_KEEPALIVE_SECS: u64 = 60;

/// HTTP client shared by the report reader and the bulk query client.
///
/// Every request goes through [`send`](Self::send), which checks the session
/// before sending and re-authenticates once on a 401.
#[derive(Clone, Debug)]
pub(crate) struct Api {
    manager: SessionManager,
    http_client: reqwest::Client,
}

/// One entry of a Salesforce REST error body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorEntry {
    message: Option<String>,
    error_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiErrorBody {
    List(Vec<ApiErrorEntry>),
    Single(ApiErrorEntry),
}

/// Extracts the first structured error message from a response body.
///
/// Salesforce answers errors with `[{"message": ..., "errorCode": ...}]`.
/// The error code is prefixed when present.
pub(crate) fn first_error_message(body: &[u8]) -> Option<String> {
    let entry = match serde_json::from_slice::<ApiErrorBody>(body).ok()? {
        ApiErrorBody::List(entries) => entries.into_iter().next()?,
        ApiErrorBody::Single(entry) => entry,
    };
    match (entry.error_code, entry.message) {
        (Some(code), Some(message)) => Some(format!("{code}: {message}")),
        (None, Some(message)) => Some(message),
        (Some(code), None) => Some(code),
        (None, None) => None,
    }
}

/// Reads a successful response body as JSON.
pub(crate) async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, Error> {
    let body = response
        .bytes()
        .await
        .map_err(|source| Error::Request { source })?;
    serde_json::from_slice(&body).map_err(|source| Error::Json { source })
}

impl Api {
    pub(crate) fn new(manager: SessionManager) -> Result<Self, Error> {
        let http_client = reqwest::ClientBuilder::new()
            .connect_timeout(manager.connect_timeout())
            .timeout(manager.request_timeout())
            .tcp_keepalive(std::time::Duration::from_secs(TCP_KEEPALIVE_SECS))
            .build()
            .map_err(|source| Error::HttpClientBuild { source })?;

        Ok(Self {
            manager,
            http_client,
        })
    }

    /// Sends a bearer-authorized request built by `build`.
    ///
    /// `session` is the caller's working copy. It is replaced whole when it
    /// has expired, and once more if the server answers 401. A second 401
    /// is returned as [`auth::Error::Unauthorized`]; any other status >= 400
    /// becomes [`Error::Http`].
    pub(crate) async fn send<F>(&self, session: &mut Session, build: F) -> Result<reqwest::Response, Error>
    where
        F: Fn(&reqwest::Client, &Session) -> reqwest::RequestBuilder,
    {
        *session = self
            .manager
            .ensure_valid(session)
            .await
            .map_err(|source| Error::Auth { source })?;

        let mut reauthenticated = false;
        loop {
            let response = build(&self.http_client, &*session)
                .bearer_auth(session.bearer_token())
                .send()
                .await
                .map_err(|source| Error::Request { source })?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                let body = response.bytes().await.unwrap_or_default();
                let message = first_error_message(&body);
                if reauthenticated {
                    return Err(Error::Auth {
                        source: auth::Error::Unauthorized { message },
                    });
                }

                warn!(
                    instance_url = session.instance_url(),
                    reason = message.as_deref().unwrap_or(""),
                    "request unauthorized, re-authenticating"
                );
                *session = self
                    .manager
                    .authenticate()
                    .await
                    .map_err(|source| Error::Auth { source })?;
                reauthenticated = true;
                continue;
            }

            if status.is_client_error() || status.is_server_error() {
                let body = response
                    .bytes()
                    .await
                    .map_err(|source| Error::Request { source })?;
                return Err(Error::Http {
                    status: status.as_u16(),
                    message: first_error_message(&body),
                });
            }

            return Ok(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_first_error_message_from_list() {
        let body = br#"[{"message":"The requested resource does not exist","errorCode":"NOT_FOUND"}]"#;
        assert_eq!(
            first_error_message(body).as_deref(),
            Some("NOT_FOUND: The requested resource does not exist")
        );
    }

    #[test]
    fn test_first_error_message_takes_first_entry() {
        let body = br#"[{"message":"first"},{"message":"second"}]"#;
        assert_eq!(first_error_message(body).as_deref(), Some("first"));
    }

    #[test]
    fn test_first_error_message_from_object() {
        let body = br#"{"errorCode":"INVALIDJOB","message":"Job not found"}"#;
        assert_eq!(first_error_message(body).as_deref(), Some("INVALIDJOB: Job not found"));
    }

    #[test]
    fn test_first_error_message_unstructured() {
        assert_eq!(first_error_message(b"<html>Bad Gateway</html>"), None);
        assert_eq!(first_error_message(b"[]"), None);
    }

    #[tokio::test]
    async fn test_send_maps_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/services/data/v65.0/limits"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!([
                { "message": "API is disabled for this user", "errorCode": "API_DISABLED_FOR_ORG" }
            ])))
            .mount(&server)
            .await;

        let api = Api::new(test_support::manager(&server)).unwrap();
        let mut session = test_support::session(&server.uri(), "token", Duration::from_secs(3600));
        let result = api
            .send(&mut session, |client, s| client.get(format!("{}/limits", s.api_base_url())))
            .await;

        assert!(matches!(
            result,
            Err(Error::Http { status: 403, message: Some(ref m) })
                if m == "API_DISABLED_FOR_ORG: API is disabled for this user"
        ));
    }

    #[tokio::test]
    async fn test_send_retries_once_after_401() {
        let server = MockServer::start().await;
        test_support::mount_token(&server, "fresh").await;
        test_support::mount_versions(&server, &["65.0"]).await;
        Mock::given(method("GET"))
            .and(path("/services/data/v65.0/limits"))
            .and(header("authorization", "Bearer revoked"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!([
                { "message": "Session expired or invalid", "errorCode": "INVALID_SESSION_ID" }
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/services/data/v65.0/limits"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let api = Api::new(test_support::manager(&server)).unwrap();
        let mut session = test_support::session(&server.uri(), "revoked", Duration::from_secs(3600));
        let response = api
            .send(&mut session, |client, s| client.get(format!("{}/limits", s.api_base_url())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(session.bearer_token(), "fresh");
    }

    #[tokio::test]
    async fn test_send_gives_up_after_second_401() {
        let server = MockServer::start().await;
        test_support::mount_token(&server, "fresh").await;
        test_support::mount_versions(&server, &["65.0"]).await;
        Mock::given(method("GET"))
            .and(path("/services/data/v65.0/limits"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!([
                { "message": "Session expired or invalid", "errorCode": "INVALID_SESSION_ID" }
            ])))
            .expect(2)
            .mount(&server)
            .await;

        let api = Api::new(test_support::manager(&server)).unwrap();
        let mut session = test_support::session(&server.uri(), "revoked", Duration::from_secs(3600));
        let result = api
            .send(&mut session, |client, s| client.get(format!("{}/limits", s.api_base_url())))
            .await;

        assert!(matches!(
            result,
            Err(Error::Auth {
                source: auth::Error::Unauthorized { .. }
            })
        ));
    }

    #[tokio::test]
    async fn test_send_refreshes_expired_session_first() {
        let server = MockServer::start().await;
        test_support::mount_token(&server, "fresh").await;
        test_support::mount_versions(&server, &["65.0"]).await;
        Mock::given(method("GET"))
            .and(path("/services/data/v65.0/limits"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let api = Api::new(test_support::manager(&server)).unwrap();
        let mut session = test_support::expired_session(&server.uri());
        api.send(&mut session, |client, s| client.get(format!("{}/limits", s.api_base_url())))
            .await
            .unwrap();

        assert!(session.is_valid());
    }
}
