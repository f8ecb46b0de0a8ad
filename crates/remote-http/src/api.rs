//! HTTP client for the primary REST API.
//!
//! Records travel as JSON objects keyed by `_id`; the server assigns the id
//! on create and echoes the full record back. A `401`/`403` invalidates the
//! shared session so the orchestrator stops calling out until re-login.

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use tallybook_core::model::{EntityKind, JsonMap};
use tallybook_core::sync::remote::{
    DatasetExport, MigrationCounts, RemoteApi, RemoteError, RemoteRecord,
};
use tallybook_core::sync::session::AuthSession;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

/// Client for the primary REST API.
#[derive(Debug, Clone)]
pub struct HttpRemoteApi {
    client: reqwest::Client,
    base_url: String,
    session: Arc<AuthSession>,
}

fn transport_err(err: reqwest::Error) -> RemoteError {
    RemoteError::transient(err.to_string())
}

fn log_response(status: reqwest::StatusCode, body: &str) {
    if status.is_success() {
        debug!("API response status: {}", status);
        return;
    }

    let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
        preview.push_str("...");
    }
    debug!("API response error ({}): {}", status, preview);
}

/// Split a raw record object into `(_id, remaining fields)`.
fn split_record(mut raw: JsonMap) -> Option<RemoteRecord> {
    let id = match raw.remove("_id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id,
        _ => return None,
    };
    Some(RemoteRecord { id, fields: raw })
}

impl HttpRemoteApi {
    /// Create a new API client.
    ///
    /// `base_url` is the API root without a trailing slash, e.g.
    /// `https://api.tallybook.app`.
    pub fn new(base_url: &str, session: Arc<AuthSession>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        }
    }

    fn collection_url(&self, kind: EntityKind) -> String {
        format!("{}/api/{}", self.base_url, kind.api_path())
    }

    fn record_url(&self, kind: EntityKind, remote_id: &str) -> String {
        format!(
            "{}/api/{}/{}",
            self.base_url,
            kind.api_path(),
            urlencoding::encode(remote_id)
        )
    }

    /// Create headers for an API request.
    fn headers(&self) -> Result<HeaderMap, RemoteError> {
        let token = self.session.token().ok_or(RemoteError::Unauthorized)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| RemoteError::Unauthorized)?;
        headers.insert(AUTHORIZATION, auth_value);

        Ok(headers)
    }

    /// Classify a response: success passes through, failures are mapped to
    /// the sync error taxonomy. An auth failure also drops the session token.
    async fn check(&self, response: reqwest::Response) -> Result<String, RemoteError> {
        let status = response.status();
        let body = response.text().await.map_err(transport_err)?;
        log_response(status, &body);

        if status.is_success() {
            return Ok(body);
        }
        if matches!(status.as_u16(), 401 | 403) {
            self.session.invalidate();
        }
        Err(RemoteError::from_status(status.as_u16(), body))
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    /// GET /api/{collection}
    async fn list(&self, kind: EntityKind) -> Result<Vec<RemoteRecord>, RemoteError> {
        let url = self.collection_url(kind);
        debug!("Listing {}: {}", kind.api_path(), url);

        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await
            .map_err(transport_err)?;

        let body = self.check(response).await?;
        let raw: Vec<JsonMap> = serde_json::from_str(&body)
            .map_err(|e| RemoteError::validation(format!("unexpected list body: {}", e)))?;

        Ok(raw.into_iter().filter_map(split_record).collect())
    }

    /// POST /api/{collection}
    async fn create(&self, kind: EntityKind, payload: &JsonMap) -> Result<String, RemoteError> {
        let url = self.collection_url(kind);
        debug!("Creating {}: {}", kind.api_path(), url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(payload)
            .send()
            .await
            .map_err(transport_err)?;

        let body = self.check(response).await?;
        let raw: JsonMap = serde_json::from_str(&body)
            .map_err(|e| RemoteError::validation(format!("unexpected create body: {}", e)))?;

        split_record(raw)
            .map(|record| record.id)
            .ok_or_else(|| RemoteError::validation("create response carried no _id"))
    }

    /// PUT /api/{collection}/{id}
    async fn update(
        &self,
        kind: EntityKind,
        remote_id: &str,
        payload: &JsonMap,
    ) -> Result<(), RemoteError> {
        let url = self.record_url(kind, remote_id);
        debug!("Updating {} {}: {}", kind.api_path(), remote_id, url);

        let response = self
            .client
            .put(&url)
            .headers(self.headers()?)
            .json(payload)
            .send()
            .await
            .map_err(transport_err)?;

        self.check(response).await?;
        Ok(())
    }

    /// DELETE /api/{collection}/{id}
    async fn delete(&self, kind: EntityKind, remote_id: &str) -> Result<(), RemoteError> {
        let url = self.record_url(kind, remote_id);
        debug!("Deleting {} {}: {}", kind.api_path(), remote_id, url);

        let response = self
            .client
            .delete(&url)
            .headers(self.headers()?)
            .send()
            .await
            .map_err(transport_err)?;

        self.check(response).await?;
        Ok(())
    }

    /// POST /api/migrate
    ///
    /// Submits the complete local dataset keyed by collection; the server
    /// replies with per-collection imported counts.
    async fn migrate(&self, dataset: &DatasetExport) -> Result<MigrationCounts, RemoteError> {
        let url = format!("{}/api/migrate", self.base_url);
        debug!("Migrating full dataset: {}", url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(dataset)
            .send()
            .await
            .map_err(transport_err)?;

        let body = self.check(response).await?;
        serde_json::from_str(&body)
            .map_err(|e| RemoteError::validation(format!("unexpected migrate body: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response on an ephemeral port, then exit.
    async fn one_shot_server(status_line: &'static str, body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buf = [0_u8; 4096];
            let _ = stream.read(&mut buf).await;

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.expect("write");
        });

        addr
    }

    fn session_with_token() -> Arc<AuthSession> {
        let session = Arc::new(AuthSession::new());
        session.set_credentials("test-token", "user-1");
        session
    }

    #[tokio::test]
    async fn list_splits_ids_from_fields() {
        let addr = one_shot_server(
            "200 OK",
            r#"[{"_id":"abc123","name":"acme"},{"name":"missing id, dropped"}]"#,
        )
        .await;

        let api = HttpRemoteApi::new(&format!("http://{}", addr), session_with_token());
        let records = api.list(EntityKind::Client).await.expect("list");

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "abc123");
        assert_eq!(records[0].fields["name"], "acme");
        assert!(!records[0].fields.contains_key("_id"));
    }

    #[tokio::test]
    async fn auth_failure_invalidates_the_session() {
        let addr = one_shot_server("401 Unauthorized", r#"{"error":"expired"}"#).await;

        let session = session_with_token();
        let api = HttpRemoteApi::new(&format!("http://{}", addr), Arc::clone(&session));
        let err = api.list(EntityKind::Goal).await.unwrap_err();

        assert!(matches!(err, RemoteError::Unauthorized));
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn missing_token_fails_before_any_request() {
        // No server at all: an unauthenticated client must not reach it.
        let api = HttpRemoteApi::new("http://127.0.0.1:1", Arc::new(AuthSession::new()));
        let err = api.list(EntityKind::Expense).await.unwrap_err();
        assert!(matches!(err, RemoteError::Unauthorized));
    }

    #[tokio::test]
    async fn server_errors_classify_as_transient() {
        let addr = one_shot_server("503 Service Unavailable", "busy").await;

        let api = HttpRemoteApi::new(&format!("http://{}", addr), session_with_token());
        let err = api.delete(EntityKind::Todo, "abc123").await.unwrap_err();
        assert!(matches!(err, RemoteError::Transient(_)));
    }
}
