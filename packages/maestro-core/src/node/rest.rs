//! REST client for one Lavalink node.
//!
//! All endpoints share the same `Authorization` header and the same status
//! semantics: 401/403 raises [`RestError::Unauthorized`], any other non-2xx
//! returns an empty/failure-shaped payload rather than raising.

use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::config::NodeConfig;
use crate::error::{RestError, RestResult};
use crate::protocol::{LoadResult, PluginInfo, TrackData, TrackInfo};

/// Timeout for each REST request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client bound to one node's base URL and password.
pub struct RestClient {
    http: Client,
    base: String,
    password: String,
}

impl RestClient {
    /// Creates a REST client for the node described by `config`.
    #[must_use]
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            http: Client::new(),
            base: config.rest_url(),
            password: config.password.clone(),
        }
    }

    /// Maps a response's status into the shared error semantics.
    ///
    /// Returns `Ok(None)` for non-2xx statuses other than auth failures so
    /// callers can substitute their endpoint's empty shape.
    async fn read_json<T: DeserializeOwned>(response: Response) -> RestResult<Option<T>> {
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RestError::Unauthorized),
            status if !status.is_success() => {
                log::debug!("[REST] non-success status {status}, returning empty payload");
                Ok(None)
            }
            _ => Ok(response.json().await.ok()),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> RestResult<Option<T>> {
        let response = self
            .http
            .get(format!("{}{}", self.base, path))
            .query(query)
            .header(AUTHORIZATION, &self.password)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> RestResult<Option<T>> {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(body)
            .header(AUTHORIZATION, &self.password)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::read_json(response).await
    }

    /// Resolves an identifier against the node's `loadtracks` endpoint.
    ///
    /// Non-2xx responses (other than auth failures) come back as a
    /// `NO_MATCHES`-shaped result.
    pub async fn load_tracks(&self, identifier: &str) -> RestResult<LoadResult> {
        let result = self
            .get_json("/loadtracks", &[("identifier", identifier)])
            .await?;
        Ok(result.unwrap_or_else(LoadResult::no_matches))
    }

    /// Translates one encoded track string into metadata.
    pub async fn decode_track(&self, encoded: &str) -> RestResult<Option<TrackInfo>> {
        self.get_json("/decodetrack", &[("track", encoded)]).await
    }

    /// Translates a batch of encoded track strings into metadata.
    pub async fn decode_tracks(&self, encoded: &[String]) -> RestResult<Vec<TrackData>> {
        let result = self.post_json("/decodetracks", &json!(encoded)).await?;
        Ok(result.unwrap_or_default())
    }

    /// Current state of the node's outbound-IP rotation subsystem.
    pub async fn routeplanner_status(&self) -> RestResult<Option<Value>> {
        self.get_json("/routeplanner/status", &[]).await
    }

    /// Unmarks one failing outbound address on the route planner.
    pub async fn routeplanner_free_address(&self, address: &str) -> RestResult<()> {
        self.post_json::<Value>("/routeplanner/free/address", &json!({ "address": address }))
            .await?;
        Ok(())
    }

    /// Unmarks every failing outbound address on the route planner.
    pub async fn routeplanner_free_all(&self) -> RestResult<()> {
        self.post_json::<Value>("/routeplanner/free/all", &json!({}))
            .await?;
        Ok(())
    }

    /// The source managers the node has enabled, when it exposes them.
    ///
    /// Returns `None` on nodes that predate the endpoint; the caller falls
    /// back to the assume-everything-standard set.
    pub async fn sources(&self) -> RestResult<Option<Vec<String>>> {
        self.get_json("/sources", &[]).await
    }

    /// The plugins installed on the node, when it exposes them.
    pub async fn plugins(&self) -> RestResult<Option<Vec<PluginInfo>>> {
        self.get_json("/plugins", &[]).await
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient").field("base", &self.base).finish()
    }
}
