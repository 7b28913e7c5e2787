//! HTTP adapter for the backing service
//!
//! Endpoints, relative to the configured base URL:
//! - `POST sync/batch` with `{ "items": [QueueItem...] }`
//! - `GET entities/{kind}/{id}` returning a `RemoteEntity`
//!
//! A `409 Conflict` on the batch endpoint carries
//! `{ "conflicts": [EntityRef...] }` naming the diverged entities.

use super::{RemoteApi, RemoteEntity, RemoteError, RemoteResult};
use crate::queue::item::{EntityRef, QueueItem};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Serialize)]
struct BatchRequest<'a> {
    items: &'a [QueueItem],
}

#[derive(Deserialize)]
struct ConflictBody {
    conflicts: Vec<EntityRef>,
}

pub struct HttpRemote {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpRemote {
    pub fn new(base_url: Url, http: reqwest::Client) -> Self {
        Self { base_url, http }
    }

    /// Client with a request timeout; a timeout counts as a failed batch
    pub fn with_timeout(base_url: &str, timeout: Duration) -> RemoteResult<Self> {
        let base_url = parse_base_url(base_url)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("repsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        Ok(Self::new(base_url, http))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn batch_url(&self) -> RemoteResult<Url> {
        self.base_url
            .join("sync/batch")
            .map_err(|e| RemoteError::InvalidUrl(e.to_string()))
    }

    fn entity_url(&self, entity: &EntityRef) -> RemoteResult<Url> {
        self.base_url
            .join(&format!("entities/{}/{}", entity.kind, entity.id))
            .map_err(|e| RemoteError::InvalidUrl(e.to_string()))
    }
}

/// Normalise so relative joins append instead of replacing the last segment
pub fn parse_base_url(raw: &str) -> RemoteResult<Url> {
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    Url::parse(&with_slash).map_err(|e| RemoteError::InvalidUrl(e.to_string()))
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(err.to_string())
    }
}

/// Map a non-success batch response to the failure taxonomy
pub fn classify_batch_response(status: StatusCode, body: &str) -> RemoteError {
    if status == StatusCode::CONFLICT {
        if let Ok(parsed) = serde_json::from_str::<ConflictBody>(body) {
            return RemoteError::VersionConflict { entities: parsed.conflicts };
        }
        return RemoteError::InvalidResponse(format!("unreadable conflict body: {}", body));
    }

    RemoteError::Server {
        status: status.as_u16(),
        message: body.to_string(),
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn submit_batch(&self, items: &[QueueItem]) -> RemoteResult<()> {
        let url = self.batch_url()?;

        debug!(url = %url, items = items.len(), "submitting batch");

        let response = self
            .http
            .post(url)
            .json(&BatchRequest { items })
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            info!(items = items.len(), "batch accepted by remote");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let err = classify_batch_response(status, &body);
        warn!(status = %status, error = %err, "batch rejected by remote");
        Err(err)
    }

    async fn fetch_entity(&self, entity: &EntityRef) -> RemoteResult<RemoteEntity> {
        let url = self.entity_url(entity)?;

        debug!(entity = %entity, url = %url, "fetching entity");

        let response = self.http.get(url).send().await.map_err(transport_error)?;

        match response.status() {
            StatusCode::OK => response
                .json::<RemoteEntity>()
                .await
                .map_err(|e| RemoteError::InvalidResponse(e.to_string())),
            StatusCode::NOT_FOUND => Err(RemoteError::NotFound(entity.clone())),
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(RemoteError::Server {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::item::EntityKind;

    #[test]
    fn test_conflict_body_maps_to_version_conflict() {
        let body = r#"{"conflicts":[{"kind":"workout","id":"1"},{"kind":"template","id":"2"}]}"#;
        let err = classify_batch_response(StatusCode::CONFLICT, body);
        assert_eq!(
            err,
            RemoteError::VersionConflict {
                entities: vec![EntityRef::workout("1"), EntityRef::template("2")]
            }
        );
    }

    #[test]
    fn test_garbled_conflict_body_is_not_a_conflict() {
        let err = classify_batch_response(StatusCode::CONFLICT, "oops");
        assert!(matches!(err, RemoteError::InvalidResponse(_)));
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_server_errors_keep_status() {
        let err = classify_batch_response(StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(
            err,
            RemoteError::Server { status: 502, message: "upstream down".to_string() }
        );
        assert!(err.is_transient());
    }

    #[test]
    fn test_urls_join_under_base_path() {
        let remote = HttpRemote::with_timeout("https://api.example.com/v1", Duration::from_secs(5))
            .unwrap();
        assert_eq!(
            remote.batch_url().unwrap().as_str(),
            "https://api.example.com/v1/sync/batch"
        );
        let entity = EntityRef::new(EntityKind::BodyMetric, "bm-7");
        assert_eq!(
            remote.entity_url(&entity).unwrap().as_str(),
            "https://api.example.com/v1/entities/body_metric/bm-7"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(parse_base_url("not a url"), Err(RemoteError::InvalidUrl(_))));
    }
}
