// crates/client/src/engine.rs
//! REST client for the job engine: control requests and final results.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use scanwatch_core::{ControlAction, JobHandle, Row, WatchConfig};

use crate::error::EngineError;

#[async_trait]
pub trait JobEngine: Send + Sync + 'static {
    /// POST `/api/{segment}/{jobId}/{action}`; any 2xx is success.
    async fn control(&self, handle: &JobHandle, action: ControlAction) -> Result<(), EngineError>;

    /// GET `/api/{segment}/{jobId}/results`.
    async fn results(&self, handle: &JobHandle) -> Result<Vec<Row>, EngineError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ResultsBody {
    Rows(Vec<Row>),
    Wrapped { results: Vec<Row> },
}

impl From<ResultsBody> for Vec<Row> {
    fn from(body: ResultsBody) -> Self {
        match body {
            ResultsBody::Rows(rows) | ResultsBody::Wrapped { results: rows } => rows,
        }
    }
}

#[derive(Clone)]
pub struct HttpJobEngine {
    client: reqwest::Client,
    api_base: String,
}

impl HttpJobEngine {
    pub fn new(config: &WatchConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(EngineError::Client)?;
        Ok(Self {
            client,
            api_base: config.api_base().to_string(),
        })
    }

    fn job_url(&self, handle: &JobHandle, endpoint: &str) -> String {
        format!(
            "{}/api/{}/{}/{}",
            self.api_base,
            handle.kind.route_segment(),
            urlencoding::encode(&handle.job_id),
            endpoint
        )
    }
}

#[async_trait]
impl JobEngine for HttpJobEngine {
    async fn control(&self, handle: &JobHandle, action: ControlAction) -> Result<(), EngineError> {
        let url = self.job_url(handle, action.as_str());
        debug!(%url, "sending control request");
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| EngineError::transport(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::rejected(&url, status, body));
        }
        Ok(())
    }

    async fn results(&self, handle: &JobHandle) -> Result<Vec<Row>, EngineError> {
        let url = self.job_url(handle, "results");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::transport(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::rejected(&url, status, body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::transport(&url, e))?;
        let body: ResultsBody = serde_json::from_slice(&bytes).map_err(|e| EngineError::Malformed {
            url: url.clone(),
            message: e.to_string(),
        })?;
        Ok(body.into())
    }
}
