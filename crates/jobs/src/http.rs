//! HTTP client for the judge service.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use triage_core::{GuessFilter, ModelId, QueueItem, ThreadId};

use crate::api::{CancelReply, JudgeApi, QueueSource, StartAck, StatusItem, ThreadDetail};
use crate::config::JobsConfig;
use crate::error::{ApiError, ConfigError};

#[derive(Serialize)]
struct BulkStatusRequest<'a> {
    thread_ids: &'a [ThreadId],
}

#[derive(Deserialize)]
struct Items<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct StateEnvelope {
    #[serde(default)]
    state: HashMap<String, String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
}

/// [`JudgeApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpJudgeClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpJudgeClient {
    pub fn new(api_url: &str) -> Result<Self, ConfigError> {
        let base_url = Url::parse(api_url).map_err(|e| ConfigError::InvalidValue {
            key: "TRIAGE_API_URL",
            value: api_url.to_string(),
            reason: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_API_URL",
                value: api_url.to_string(),
                reason: "not a base URL".to_string(),
            });
        }
        // No request timeout: an analysis start can legitimately take long.
        let client = Client::builder()
            .user_agent(concat!("triage-judge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            token: None,
        })
    }

    pub fn with_token(api_url: &str, token: String) -> Result<Self, ConfigError> {
        let mut client = Self::new(api_url)?;
        client.token = Some(token);
        Ok(client)
    }

    pub fn from_config(config: &JobsConfig) -> Result<Self, ConfigError> {
        match &config.auth_token {
            Some(token) => Self::with_token(&config.api_url, token.clone()),
            None => Self::new(&config.api_url),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, ApiError> {
        let resp = self
            .authorized(req)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.detail)
            .and_then(|d| match d {
                serde_json::Value::String(s) if !s.trim().is_empty() => Some(s),
                _ => None,
            })
            .unwrap_or_else(|| format!("LLM failed ({status})"));
        Err(ApiError::Rejected { status, detail })
    }

    async fn json<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
        resp.json()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))
    }
}

#[async_trait]
impl JudgeApi for HttpJudgeClient {
    async fn start(&self, thread_id: &ThreadId, model: &ModelId) -> Result<StartAck, ApiError> {
        let url = self.endpoint(&["judge", thread_id.as_str()]);
        let req = self.client.post(url).query(&[("model", model.as_str())]);
        let resp = self.send(req).await?;
        // An accepted start with an unreadable body is still accepted.
        Ok(Self::json(resp).await.unwrap_or_else(|e: ApiError| {
            tracing::warn!(thread_id = %thread_id, error = %e, "unreadable start acknowledgement");
            StartAck::new(triage_core::JobStatus::Queued)
        }))
    }

    async fn cancel(&self, thread_id: &ThreadId) -> Result<CancelReply, ApiError> {
        let url = self.endpoint(&["judge", "cancel", thread_id.as_str()]);
        let resp = self.send(self.client.post(url)).await?;
        Self::json(resp).await
    }

    async fn bulk_status(&self, thread_ids: &[ThreadId]) -> Result<Vec<StatusItem>, ApiError> {
        if thread_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.endpoint(&["judge", "status", "bulk"]);
        let req = self.client.post(url).json(&BulkStatusRequest { thread_ids });
        let resp = self.send(req).await?;
        Ok(Self::json::<Items<StatusItem>>(resp).await?.items)
    }

    async fn active_jobs(&self) -> Result<Vec<StatusItem>, ApiError> {
        let url = self.endpoint(&["judge", "active"]);
        let resp = self.send(self.client.get(url)).await?;
        Ok(Self::json::<Items<StatusItem>>(resp).await?.items)
    }

    async fn quota_state(&self, model: &ModelId) -> Result<HashMap<String, String>, ApiError> {
        let url = self.endpoint(&["judge", "state"]);
        let req = self.client.get(url).query(&[("model", model.as_str())]);
        let resp = self.send(req).await?;
        Ok(Self::json::<StateEnvelope>(resp).await?.state)
    }

    async fn thread_detail(&self, thread_id: &ThreadId) -> Result<ThreadDetail, ApiError> {
        let url = self.endpoint(&["thread", thread_id.as_str()]);
        let resp = self.send(self.client.get(url)).await?;
        Self::json(resp).await
    }
}

#[async_trait]
impl QueueSource for HttpJudgeClient {
    async fn load_queue(
        &self,
        filter: GuessFilter,
        limit: usize,
    ) -> Result<Vec<QueueItem>, ApiError> {
        let url = self.endpoint(&["queue"]);
        let mut query = vec![
            ("status", "unreviewed".to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(has_llm) = filter.has_llm_param() {
            query.push(("has_llm", has_llm.to_string()));
        }
        let resp = self.send(self.client.get(url).query(&query)).await?;
        Ok(Self::json::<Items<QueueItem>>(resp).await?.items)
    }
}
