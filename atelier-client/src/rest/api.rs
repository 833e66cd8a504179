//! Item persistence API.
//!
//! [`ItemApi`] is the seam between the sync engine and the hosted store.
//! [`HttpItemApi`] speaks the JSON endpoints:
//!
//! | operation    | request                                   |
//! |--------------|-------------------------------------------|
//! | `list`       | `GET    /api/canvas/items?projectId=`     |
//! | `create`     | `POST   /api/canvas/items`                |
//! | `update`     | `PATCH  /api/canvas/items/{id}`           |
//! | `delete`     | `DELETE /api/canvas/items/{id}`           |
//! | `get_state`  | `GET    /api/canvas/state?projectId=`     |
//! | `save_state` | `PUT    /api/canvas/state?projectId=`     |

use std::sync::Arc;

use async_trait::async_trait;
use atelier_core::{CanvasItem, CanvasState, ItemPatch, NewItem, ViewportPatch};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;

use super::auth::TokenProvider;
use super::SyncError;

#[async_trait]
pub trait ItemApi: Send + Sync {
    async fn list(&self, project_id: &str) -> Result<Vec<CanvasItem>, SyncError>;

    /// Persist a new item. The result carries the authoritative id and
    /// timestamps.
    async fn create(&self, project_id: &str, data: &NewItem) -> Result<CanvasItem, SyncError>;

    async fn update(&self, id: &str, patch: &ItemPatch) -> Result<CanvasItem, SyncError>;

    async fn delete(&self, id: &str) -> Result<(), SyncError>;

    /// The project's viewport row, `None` before the first save.
    async fn get_state(&self, project_id: &str) -> Result<Option<CanvasState>, SyncError>;

    async fn save_state(
        &self,
        project_id: &str,
        patch: &ViewportPatch,
    ) -> Result<CanvasState, SyncError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody<'a> {
    project_id: &'a str,
    #[serde(flatten)]
    data: &'a NewItem,
}

/// JSON-over-HTTP item API.
#[derive(Clone)]
pub struct HttpItemApi {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpItemApi {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, tokens)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            tokens,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    /// Attach the bearer token and send. Token failures return before any
    /// I/O; non-2xx statuses become [`SyncError::Http`].
    async fn send(&self, request: RequestBuilder) -> Result<Response, SyncError> {
        let token = self.tokens.token().await?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SyncError::Http {
            status: status.as_u16(),
            body,
        })
    }

    fn not_found_as(id: &str, e: SyncError) -> SyncError {
        match e {
            SyncError::Http { status, .. } if status == StatusCode::NOT_FOUND.as_u16() => {
                SyncError::NotFound(id.to_string())
            }
            other => other,
        }
    }
}

#[async_trait]
impl ItemApi for HttpItemApi {
    async fn list(&self, project_id: &str) -> Result<Vec<CanvasItem>, SyncError> {
        let request = self
            .request(Method::GET, "/api/canvas/items")
            .query(&[("projectId", project_id)]);
        Ok(self.send(request).await?.json::<Vec<CanvasItem>>().await?)
    }

    async fn create(&self, project_id: &str, data: &NewItem) -> Result<CanvasItem, SyncError> {
        let request = self
            .request(Method::POST, "/api/canvas/items")
            .json(&CreateBody { project_id, data });
        Ok(self.send(request).await?.json::<CanvasItem>().await?)
    }

    async fn update(&self, id: &str, patch: &ItemPatch) -> Result<CanvasItem, SyncError> {
        let request = self
            .request(Method::PATCH, &format!("/api/canvas/items/{id}"))
            .json(patch);
        let response = self
            .send(request)
            .await
            .map_err(|e| Self::not_found_as(id, e))?;
        Ok(response.json::<CanvasItem>().await?)
    }

    async fn delete(&self, id: &str) -> Result<(), SyncError> {
        let request = self.request(Method::DELETE, &format!("/api/canvas/items/{id}"));
        self.send(request)
            .await
            .map_err(|e| Self::not_found_as(id, e))?;
        Ok(())
    }

    async fn get_state(&self, project_id: &str) -> Result<Option<CanvasState>, SyncError> {
        let request = self
            .request(Method::GET, "/api/canvas/state")
            .query(&[("projectId", project_id)]);
        match self.send(request).await {
            Ok(response) => Ok(response.json::<Option<CanvasState>>().await?),
            Err(SyncError::Http { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn save_state(
        &self,
        project_id: &str,
        patch: &ViewportPatch,
    ) -> Result<CanvasState, SyncError> {
        let request = self
            .request(Method::PUT, "/api/canvas/state")
            .query(&[("projectId", project_id)])
            .json(patch);
        Ok(self.send(request).await?.json::<CanvasState>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::auth::{AuthError, StaticToken};

    #[test]
    fn test_base_url_is_normalized() {
        let api = HttpItemApi::new("https://canvas.example/", Arc::new(StaticToken::new("t")));
        assert_eq!(api.base_url(), "https://canvas.example");
        assert_eq!(
            api.url("/api/canvas/items"),
            "https://canvas.example/api/canvas/items"
        );
    }

    #[test]
    fn test_create_body_is_flat_camel_case() {
        let data = NewItem {
            x: 10.0,
            z_index: Some(3),
            ..NewItem::default()
        };
        let json = serde_json::to_value(CreateBody {
            project_id: "p1",
            data: &data,
        })
        .unwrap();
        assert_eq!(json["projectId"], "p1");
        assert_eq!(json["x"], 10.0);
        assert_eq!(json["zIndex"], 3);
    }

    #[tokio::test]
    async fn test_missing_token_short_circuits() {
        // Nothing listens here; the request must never be attempted.
        let api = HttpItemApi::new("http://127.0.0.1:9", Arc::new(StaticToken::anonymous()));
        assert_eq!(
            api.list("p1").await,
            Err(SyncError::Auth(AuthError::NotAuthenticated))
        );
        assert_eq!(
            api.delete("i1").await,
            Err(SyncError::Auth(AuthError::NotAuthenticated))
        );
    }

    #[test]
    fn test_not_found_mapping() {
        let e = HttpItemApi::not_found_as(
            "i9",
            SyncError::Http {
                status: 404,
                body: String::new(),
            },
        );
        assert_eq!(e, SyncError::NotFound("i9".into()));
        let e = HttpItemApi::not_found_as("i9", SyncError::Network("reset".into()));
        assert_eq!(e, SyncError::Network("reset".into()));
    }
}
