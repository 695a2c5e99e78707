//! Client for the remote compute service.
//!
//! Every operation is a form POST of the configuration plus the client id;
//! `/clean` is a GET with query parameters.  A non-success status or a
//! failed connection is a `Transport` error carrying the raw status/error
//! text; an `{"error": ...}` body is a `Logical` error.  Nothing is retried.

use std::time::Duration;

use chrono::Utc;
use ndvi_proto::configuration::Configuration;
use ndvi_proto::protocol::{BandInfo, Endpoint, LayerResponse, OperationResponse};
use rand::Rng;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The service answered with an error payload.
    #[error("{0}")]
    Logical(String),
    /// No usable answer: connection failure, non-success status or an
    /// unreadable body.
    #[error("{0}")]
    Transport(String),
}

impl RemoteError {
    /// First alert line for this failure.
    pub fn headline(&self) -> &'static str {
        match self {
            RemoteError::Logical(_) => "The request failed.",
            RemoteError::Transport(_) => "The server could not be reached.",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RemoteError::Logical(m) | RemoteError::Transport(m) => m,
        }
    }
}

const CLIENT_ID_SUFFIX: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Session identity: epoch seconds followed by six characters of `[A-Z0-9]`.
pub fn generate_client_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| CLIENT_ID_SUFFIX[rng.gen_range(0..CLIENT_ID_SUFFIX.len())] as char)
        .collect();
    format!("{}{}", Utc::now().timestamp(), suffix)
}

#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
}

impl RemoteClient {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        connect_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path())
    }

    /// Compute the layer for `config` and return its bands.
    pub async fn request_layer(&self, config: &Configuration) -> Result<Vec<BandInfo>, RemoteError> {
        let body = self.post(Endpoint::MapId, config).await?;
        parse_layer_body(&body)
    }

    pub async fn chart(&self, config: &Configuration) -> Result<OperationResponse, RemoteError> {
        let body = self.post(Endpoint::Chart, config).await?;
        parse_operation_body(&body)
    }

    pub async fn export(&self, config: &Configuration) -> Result<OperationResponse, RemoteError> {
        let body = self.post(Endpoint::Export, config).await?;
        parse_operation_body(&body)
    }

    pub async fn download(&self, config: &Configuration) -> Result<OperationResponse, RemoteError> {
        let body = self.post(Endpoint::Download, config).await?;
        parse_operation_body(&body)
    }

    /// Cancel a running export task owned by this client.
    pub async fn cancel_export(&self, task_id: &str) -> Result<OperationResponse, RemoteError> {
        let body = self
            .get(Endpoint::Clean, &[("task", task_id), ("client_id", self.client_id.as_str())])
            .await?;
        parse_operation_body(&body)
    }

    /// Delete the exported files named `filename` owned by this client.
    pub async fn delete_export(&self, filename: &str) -> Result<OperationResponse, RemoteError> {
        let body = self
            .get(
                Endpoint::Clean,
                &[("filename", filename), ("client_id", self.client_id.as_str())],
            )
            .await?;
        parse_operation_body(&body)
    }

    async fn post(&self, endpoint: Endpoint, config: &Configuration) -> Result<String, RemoteError> {
        let form = config
            .to_form(&self.client_id)
            .map_err(|e| RemoteError::Transport(format!("cannot encode request: {}", e)))?;
        debug!("remote: POST {}", endpoint.path());
        let response = self
            .http
            .post(self.url(endpoint))
            .form(&form)
            .send()
            .await
            .map_err(transport)?;
        read_body(endpoint, response).await
    }

    async fn get(&self, endpoint: Endpoint, query: &[(&str, &str)]) -> Result<String, RemoteError> {
        debug!("remote: GET {}", endpoint.path());
        let response = self
            .http
            .get(self.url(endpoint))
            .query(query)
            .send()
            .await
            .map_err(transport)?;
        read_body(endpoint, response).await
    }
}

fn transport(err: reqwest::Error) -> RemoteError {
    RemoteError::Transport(err.to_string())
}

async fn read_body(endpoint: Endpoint, response: reqwest::Response) -> Result<String, RemoteError> {
    let status = response.status();
    if !status.is_success() {
        warn!("remote: {} returned status {}", endpoint.path(), status);
        return Err(RemoteError::Transport(status.to_string()));
    }
    response.text().await.map_err(transport)
}

/// Interpret a `/mapid` body.
pub fn parse_layer_body(body: &str) -> Result<Vec<BandInfo>, RemoteError> {
    match serde_json::from_str::<LayerResponse>(body) {
        Ok(LayerResponse::Bands { bands }) => Ok(bands),
        Ok(LayerResponse::Failed { error }) => Err(RemoteError::Logical(error)),
        Err(e) => Err(RemoteError::Transport(format!("invalid layer response: {}", e))),
    }
}

/// Interpret a chart/export/download/clean body.  Empty means success.
pub fn parse_operation_body(body: &str) -> Result<OperationResponse, RemoteError> {
    if body.trim().is_empty() {
        return Ok(OperationResponse::default());
    }
    let response: OperationResponse = serde_json::from_str(body)
        .map_err(|e| RemoteError::Transport(format!("invalid response: {}", e)))?;
    match response.error {
        Some(error) => Err(RemoteError::Logical(error)),
        None => Ok(response),
    }
}
