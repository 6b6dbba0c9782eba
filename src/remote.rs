use crate::config::Config;
use crate::error::NetworkError;
use crate::recording::CompletedRecording;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use serde::Deserialize;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

/// The remote authority: tells the agent whether to record and receives
/// finished recordings
#[async_trait]
pub trait RemoteEndpoint: Send + Sync + 'static {
    async fn fetch_desired_state(&self) -> Result<bool, NetworkError>;

    async fn submit(&self, recording: &CompletedRecording) -> Result<(), NetworkError>;
}

/// Shapes accepted from `GET /status`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StatusBody {
    Flag(bool),
    Object {
        #[serde(alias = "record", alias = "status")]
        recording: Flag,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

impl Flag {
    fn into_bool(self) -> Result<bool, NetworkError> {
        match self {
            Flag::Bool(b) => Ok(b),
            Flag::Text(text) if text.trim().eq_ignore_ascii_case("true") => Ok(true),
            Flag::Text(text) if text.trim().eq_ignore_ascii_case("false") => Ok(false),
            Flag::Text(text) => Err(NetworkError::Malformed(format!(
                "unexpected recording flag {:?}",
                text
            ))),
        }
    }
}

/// Parse the desired recording flag out of a status response body
///
/// Accepts a bare JSON boolean or an object carrying a `recording` (or
/// `record`/`status`) field. Anything else is rejected rather than guessed at.
pub fn parse_desired_state(body: &str) -> Result<bool, NetworkError> {
    let parsed: StatusBody = serde_json::from_str(body.trim())
        .map_err(|e| NetworkError::Malformed(e.to_string()))?;

    match parsed {
        StatusBody::Flag(b) => Ok(b),
        StatusBody::Object { recording } => recording.into_bool(),
    }
}

/// `RemoteEndpoint` over plain HTTP
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    endpoint: String,
}

impl HttpRemote {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }
}

#[async_trait]
impl RemoteEndpoint for HttpRemote {
    async fn fetch_desired_state(&self) -> Result<bool, NetworkError> {
        let response = self.client.get(self.url("status")).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Status(status));
        }

        let body = response.text().await?;
        let desired = parse_desired_state(&body)?;
        tracing::debug!("Remote desired state: {}", desired);
        Ok(desired)
    }

    async fn submit(&self, recording: &CompletedRecording) -> Result<(), NetworkError> {
        let path = recording.path();
        let size = tokio::fs::metadata(path).await?.len();

        // Stream the file from disk rather than reading it into memory
        let file = File::open(path).await?;
        let body = Body::wrap_stream(ReaderStream::new(file));

        let part = Part::stream_with_length(body, size)
            .file_name(recording.name.clone())
            .mime_str(&recording.mime_type)?;
        let form = Form::new().part("file", part);

        tracing::info!(
            "Uploading {} ({:.2} MB)",
            recording.name,
            size as f64 / (1024.0 * 1024.0)
        );

        let response = self
            .client
            .post(self.url("upload"))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Status(status));
        }

        Ok(())
    }
}
