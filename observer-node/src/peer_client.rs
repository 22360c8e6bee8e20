//! Outbound HTTP to a sibling node: the client side of the exact same
//! PUT/GET/PATCH/DELETE protocol every node serves. Plays the role the
//! teacher's `reqwest`-free websocket send/receive pair plays for its own
//! protocol — a single narrow place that knows how to talk to the other
//! side, so the delegation router above it stays about policy, not
//! wire format.

use std::time::Duration;

use observer_protocol::{
    DeleteStreamResponse, LoadResponse, PatchStreamRequest, PatchStreamResponse, PutStreamRequest,
    StreamView,
};
use reqwest::StatusCode;

use crate::error::ApiError;

const PEER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
}

impl Default for PeerClient {
    fn default() -> Self {
        let http = reqwest::Client::builder()
            .timeout(PEER_TIMEOUT)
            .build()
            .expect("reqwest client construction should never fail with defaults");
        PeerClient { http }
    }
}

impl PeerClient {
    /// Result of delegating a PUT downstream: either the child accepted it
    /// (200/201, carrying its view of the row) or declined/was unreachable.
    pub async fn try_put(
        &self,
        base_url: &str,
        handle: &str,
        gametype: &str,
        body: &PutStreamRequest,
    ) -> Option<(StatusCode, StreamView)> {
        let url = format!("{base_url}/streams/{handle}/{gametype}");
        let response = self.http.put(&url).form(body).send().await.ok()?;
        let status = response.status();
        if !status.is_success() {
            return None;
        }
        let view = response.json::<StreamView>().await.ok()?;
        Some((status, view))
    }

    pub async fn get(&self, base_url: &str, handle: &str, gametype: &str) -> Result<StreamView, ApiError> {
        let url = format!("{base_url}/streams/{handle}/{gametype}");
        let response = self.http.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound);
        }
        if !response.status().is_success() {
            return Err(downstream_error(response).await);
        }
        response
            .json::<StreamView>()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    pub async fn patch(
        &self,
        base_url: &str,
        handle: &str,
        gametype: &str,
        body: &PatchStreamRequest,
    ) -> Result<PatchStreamResponse, ApiError> {
        let url = format!("{base_url}/streams/{handle}/{gametype}");
        let response = self.http.patch(&url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(downstream_error(response).await);
        }
        response
            .json::<PatchStreamResponse>()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    pub async fn delete(
        &self,
        base_url: &str,
        handle: &str,
        gametype: &str,
    ) -> Result<DeleteStreamResponse, ApiError> {
        let url = format!("{base_url}/streams/{handle}/{gametype}");
        let response = self.http.delete(&url).send().await?;
        if !response.status().is_success() {
            return Err(downstream_error(response).await);
        }
        response
            .json::<DeleteStreamResponse>()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    /// Polls a child's `/load`. A timeout or any non-2xx is treated as
    /// "that child contributes 0 to the aggregate" per the load-endpoint
    /// spec, rather than failing the whole request.
    pub async fn get_load(&self, base_url: &str) -> Option<LoadResponse> {
        let url = format!("{base_url}/load");
        let response = self.http.get(&url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<LoadResponse>().await.ok()
    }
}

async fn downstream_error(response: reqwest::Response) -> ApiError {
    let status = response.status();
    let body = response
        .json::<serde_json::Value>()
        .await
        .unwrap_or(serde_json::Value::Null);
    ApiError::Downstream { status, body }
}
