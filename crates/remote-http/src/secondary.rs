//! HTTP adapter for the optional row-based secondary store.
//!
//! The store exposes one table per entity kind behind a PostgREST-style
//! interface: snake_case columns, filters as query parameters, rows keyed
//! by a store-assigned UUID. Every query is scoped to the authenticated
//! user; payloads pass through a per-kind column allow-list so local
//! bookkeeping fields never leak out.

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use tallybook_core::model::{camel_to_snake, secondary_allow_list, EntityKind, IdFormat, JsonMap};
use tallybook_core::sync::reconciler::is_valid_id;
use tallybook_core::sync::remote::{RemoteError, SecondaryRow, SecondaryStore, SecondaryWrite};
use tallybook_core::sync::session::AuthSession;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Endpoint URL and API key; both must be present for the store to count
/// as configured.
#[derive(Debug, Clone)]
pub struct SecondaryConfig {
    pub url: String,
    pub api_key: String,
}

impl SecondaryConfig {
    fn is_usable(&self) -> bool {
        !self.url.trim().is_empty() && !self.api_key.trim().is_empty()
    }
}

/// Client for the secondary row store. Unconfigured instances are inert:
/// every write reports [`SecondaryWrite::Unavailable`] without network I/O.
pub struct HttpSecondaryStore {
    client: reqwest::Client,
    config: Option<SecondaryConfig>,
    session: Arc<AuthSession>,
}

/// Shape local camelCase fields into a secondary-store row: snake_case the
/// keys, drop anything outside the kind's column allow-list, and stamp the
/// owning user id.
fn secondary_payload(kind: EntityKind, fields: &JsonMap, user_id: &str) -> JsonMap {
    let allowed = secondary_allow_list(kind);
    let mut row = JsonMap::new();

    for (key, value) in fields {
        let column = camel_to_snake(key);
        if allowed.contains(&column.as_str()) {
            row.insert(column, value.clone());
        }
    }
    row.insert("user_id".to_string(), Value::String(user_id.to_string()));
    row
}

fn transport_err(err: reqwest::Error) -> RemoteError {
    RemoteError::transient(err.to_string())
}

impl HttpSecondaryStore {
    pub fn new(config: Option<SecondaryConfig>, session: Arc<AuthSession>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            config: config.filter(SecondaryConfig::is_usable),
            session,
        }
    }

    fn config(&self) -> Result<&SecondaryConfig, RemoteError> {
        self.config.as_ref().ok_or(RemoteError::Unavailable)
    }

    /// The authenticated user id; an absent or blank id is an auth failure,
    /// never an unscoped query.
    fn user_id(&self) -> Result<String, RemoteError> {
        self.session
            .user_id()
            .filter(|uid| !uid.trim().is_empty())
            .ok_or(RemoteError::Unauthorized)
    }

    fn table_url(&self, kind: EntityKind) -> Result<String, RemoteError> {
        let config = self.config()?;
        Ok(format!(
            "{}/{}",
            config.url.trim_end_matches('/'),
            kind.table_name()
        ))
    }

    /// Table URL filtered to the authenticated user's rows.
    fn scoped_url(&self, kind: EntityKind) -> Result<String, RemoteError> {
        let user_id = self.user_id()?;
        Ok(format!(
            "{}?user_id=eq.{}",
            self.table_url(kind)?,
            urlencoding::encode(&user_id)
        ))
    }

    fn headers(&self, representation: bool) -> Result<HeaderMap, RemoteError> {
        let config = self.config()?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let key_value =
            HeaderValue::from_str(&config.api_key).map_err(|_| RemoteError::Unauthorized)?;
        headers.insert("apikey", key_value);
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|_| RemoteError::Unauthorized)?;
        headers.insert(AUTHORIZATION, auth_value);

        if representation {
            headers.insert("Prefer", HeaderValue::from_static("return=representation"));
        }

        Ok(headers)
    }

    async fn check(&self, response: reqwest::Response) -> Result<String, RemoteError> {
        let status = response.status();
        let body = response.text().await.map_err(transport_err)?;

        if status.is_success() {
            return Ok(body);
        }
        if matches!(status.as_u16(), 401 | 403) {
            self.session.invalidate();
        }
        Err(RemoteError::from_status(status.as_u16(), body))
    }

    async fn insert_row(&self, kind: EntityKind, row: &JsonMap) -> Result<String, RemoteError> {
        let url = self.table_url(kind)?;
        debug!("Secondary insert into {}: {}", kind.table_name(), url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers(true)?)
            .json(row)
            .send()
            .await
            .map_err(transport_err)?;

        let body = self.check(response).await?;
        let rows: Vec<JsonMap> = serde_json::from_str(&body)
            .map_err(|e| RemoteError::validation(format!("unexpected insert body: {}", e)))?;

        rows.first()
            .and_then(|row| row.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::validation("insert representation carried no id"))
    }

    async fn update_row(
        &self,
        kind: EntityKind,
        secondary_id: &str,
        row: &JsonMap,
    ) -> Result<(), RemoteError> {
        let url = format!(
            "{}&id=eq.{}",
            self.scoped_url(kind)?,
            urlencoding::encode(secondary_id)
        );
        debug!("Secondary update of {} {}: {}", kind.table_name(), secondary_id, url);

        let response = self
            .client
            .patch(&url)
            .headers(self.headers(false)?)
            .json(row)
            .send()
            .await
            .map_err(transport_err)?;

        self.check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl SecondaryStore for HttpSecondaryStore {
    fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    async fn fetch_all(&self, kind: EntityKind) -> Result<Vec<SecondaryRow>, RemoteError> {
        self.config()?;
        let url = format!("{}&select=*", self.scoped_url(kind)?);

        let response = self
            .client
            .get(&url)
            .headers(self.headers(false)?)
            .send()
            .await
            .map_err(transport_err)?;

        let body = self.check(response).await?;
        let raw: Vec<JsonMap> = serde_json::from_str(&body)
            .map_err(|e| RemoteError::validation(format!("unexpected rows body: {}", e)))?;

        Ok(raw
            .into_iter()
            .filter_map(|mut row| {
                let id = match row.remove("id") {
                    Some(Value::String(id)) => id,
                    _ => return None,
                };
                Some(SecondaryRow { id, fields: row })
            })
            .collect())
    }

    async fn upsert(
        &self,
        kind: EntityKind,
        secondary_id: Option<&str>,
        fields: &JsonMap,
    ) -> Result<SecondaryWrite, RemoteError> {
        if self.config.is_none() {
            return Ok(SecondaryWrite::Unavailable);
        }

        let row = secondary_payload(kind, fields, &self.user_id()?);

        // A malformed stored id means the row was never written there:
        // insert, never update against a bogus key.
        match secondary_id.filter(|id| is_valid_id(id, IdFormat::UuidV4)) {
            Some(id) => {
                self.update_row(kind, id, &row).await?;
                Ok(SecondaryWrite::Updated(id.to_string()))
            }
            None => {
                let id = self.insert_row(kind, &row).await?;
                Ok(SecondaryWrite::Created(id))
            }
        }
    }

    async fn delete(
        &self,
        kind: EntityKind,
        secondary_id: Option<&str>,
    ) -> Result<SecondaryWrite, RemoteError> {
        if self.config.is_none() {
            return Ok(SecondaryWrite::Unavailable);
        }

        let Some(id) = secondary_id.filter(|id| is_valid_id(id, IdFormat::UuidV4)) else {
            // Never synced there (or synced under a broken id): nothing to
            // delete remotely.
            return Ok(SecondaryWrite::Skipped);
        };

        let url = format!("{}&id=eq.{}", self.scoped_url(kind)?, urlencoding::encode(id));
        debug!("Secondary delete of {} {}: {}", kind.table_name(), id, url);

        let response = self
            .client
            .delete(&url)
            .headers(self.headers(false)?)
            .send()
            .await
            .map_err(transport_err)?;

        self.check(response).await?;
        Ok(SecondaryWrite::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> JsonMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn configured_store(session: Arc<AuthSession>) -> HttpSecondaryStore {
        HttpSecondaryStore::new(
            Some(SecondaryConfig {
                url: "http://127.0.0.1:1/rest/v1".to_string(),
                api_key: "test-key".to_string(),
            }),
            session,
        )
    }

    #[test]
    fn payload_snake_cases_and_filters_to_the_allow_list() {
        let local = fields(&[
            ("clientId", json!("c-uuid")),
            ("issueDate", json!("2026-03-01")),
            ("amount", json!(125.5)),
            ("localOnlyFlag", json!(true)),
        ]);

        let row = secondary_payload(EntityKind::Invoice, &local, "user-1");

        assert_eq!(row["client_id"], json!("c-uuid"));
        assert_eq!(row["issue_date"], json!("2026-03-01"));
        assert_eq!(row["amount"], json!(125.5));
        assert_eq!(row["user_id"], json!("user-1"));
        assert!(!row.contains_key("localOnlyFlag"));
        assert!(!row.contains_key("local_only_flag"));
    }

    #[test]
    fn blank_config_counts_as_unconfigured() {
        let store = HttpSecondaryStore::new(
            Some(SecondaryConfig {
                url: "  ".to_string(),
                api_key: "key".to_string(),
            }),
            Arc::new(AuthSession::new()),
        );
        assert!(!store.is_configured());
    }

    #[tokio::test]
    async fn unconfigured_store_is_inert() {
        let store = HttpSecondaryStore::new(None, Arc::new(AuthSession::new()));

        let write = store
            .upsert(EntityKind::Goal, None, &JsonMap::new())
            .await
            .expect("upsert");
        assert_eq!(write, SecondaryWrite::Unavailable);

        let delete = store
            .delete(EntityKind::Goal, Some("550e8400-e29b-41d4-a716-446655440000"))
            .await
            .expect("delete");
        assert_eq!(delete, SecondaryWrite::Unavailable);

        let err = store.fetch_all(EntityKind::Goal).await.unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable));
    }

    #[tokio::test]
    async fn delete_with_invalid_id_skips_without_io() {
        // Unroutable URL: any network attempt would fail, not skip.
        let store = configured_store(Arc::new(AuthSession::new()));

        for id in [None, Some("12345"), Some("not-a-uuid")] {
            let write = store
                .delete(EntityKind::Expense, id)
                .await
                .expect("delete");
            assert_eq!(write, SecondaryWrite::Skipped, "id {:?} must skip", id);
        }
    }

    #[tokio::test]
    async fn queries_require_an_authenticated_user() {
        let store = configured_store(Arc::new(AuthSession::new()));

        let err = store.fetch_all(EntityKind::Client).await.unwrap_err();
        assert!(matches!(err, RemoteError::Unauthorized));

        let err = store
            .upsert(EntityKind::Client, None, &JsonMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Unauthorized));
    }

    #[test]
    fn scoped_url_encodes_the_user_id() {
        let session = Arc::new(AuthSession::new());
        session.set_credentials("tok", "user one+two");
        let store = configured_store(session);

        let url = store.scoped_url(EntityKind::Todo).expect("scoped url");
        assert_eq!(
            url,
            "http://127.0.0.1:1/rest/v1/todos?user_id=eq.user%20one%2Btwo"
        );
    }
}
