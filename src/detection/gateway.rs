//! Remote scoring service gateway
//!
//! Sends candidate text to the analysis endpoint:
//!
//! ```text
//! POST {base}/v1/analysis/{analysis_id}?detections=prompt_injection&scan_type=input&tag={tag}
//! Authorization: Bearer {token}
//! Content-Type: text/plain; charset=utf-8
//!
//! <candidate text>
//! ```
//!
//! and expects
//!
//! ```text
//! { "analysis": [ { "type": "score", "name": "prompt_injection", "result": 0.93 } ], "tag": "..." }
//! ```
//!
//! Each attempt is bounded by the configured timeout. Transient failures
//! (transport, timeout, 5xx) get exactly one retry; everything else
//! surfaces immediately as [`Unavailable`].

use super::types::{Score, Unavailable};
use super::Scorer;
use crate::config::{ProxyConfig, ScoringConfig};
use crate::correlation::CorrelationTag;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Name of the score entry that drives policy
const PROMPT_INJECTION: &str = "prompt_injection";

/// Status and body of one scoring request
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: String,
}

/// Wire transport to the scoring service.
///
/// Separated from [`DetectionGateway`] so tests can script responses and
/// failures without a network.
#[async_trait]
pub trait ScoringTransport: Send + Sync {
    /// Send one scoring request.
    async fn send(&self, text: &str, tag: &CorrelationTag)
        -> std::result::Result<TransportResponse, Unavailable>;
}

/// HTTP transport backed by a pooled `reqwest::Client`.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    detections: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for `{base_url}/v1/analysis/{analysis_id}`.
    pub fn new(
        base_url: &str,
        analysis_id: &str,
        token: impl Into<String>,
        detections: &[String],
        timeout: Duration,
    ) -> Result<Self> {
        if analysis_id.trim().is_empty() {
            return Err(Error::Config("scoring analysis_id is not set".to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/analysis/{}", base_url.trim_end_matches('/'), analysis_id),
            token: token.into(),
            detections: detections.join(","),
            timeout,
        })
    }

    /// Create from configuration, resolving the token from the environment.
    pub fn from_config(scoring: &ScoringConfig, timeout: Duration) -> Result<Self> {
        let token = scoring.resolve_api_token()?;
        Self::new(
            &scoring.base_url,
            &scoring.analysis_id,
            token,
            &scoring.detections,
            timeout,
        )
    }

    /// Full analysis endpoint URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ScoringTransport for HttpTransport {
    async fn send(
        &self,
        text: &str,
        tag: &CorrelationTag,
    ) -> std::result::Result<TransportResponse, Unavailable> {
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[
                ("detections", self.detections.as_str()),
                ("scan_type", "input"),
                ("tag", tag.as_str()),
            ])
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(text.to_owned())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Unavailable::Timeout(self.timeout)
                } else {
                    Unavailable::Transport(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Unavailable::Transport(format!("Failed to read response body: {}", e)))?;

        Ok(TransportResponse { status, body })
    }
}

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    #[serde(default)]
    analysis: Vec<AnalysisEntry>,
}

#[derive(Debug, Deserialize)]
struct AnalysisEntry {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    result: serde_json::Value,
}

/// Parse an analysis response body into a [`Score`].
///
/// Unknown fields are ignored. A missing `prompt_injection` score entry, or
/// one whose `result` is absent, non-numeric or outside [0, 1], is malformed.
pub fn parse_analysis(body: &str) -> std::result::Result<Score, Unavailable> {
    let raw: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| Unavailable::Malformed(format!("invalid JSON: {}", e)))?;
    let parsed: AnalysisResponse = serde_json::from_value(raw.clone())
        .map_err(|e| Unavailable::Malformed(format!("unexpected shape: {}", e)))?;

    let mut breakdown = BTreeMap::new();
    let mut value = None;

    for entry in &parsed.analysis {
        if entry.kind != "score" {
            continue;
        }
        let result = entry.result.as_f64();
        if entry.name == PROMPT_INJECTION {
            let score = result.ok_or_else(|| {
                Unavailable::Malformed("prompt_injection score has no numeric result".to_string())
            })?;
            if !(0.0..=1.0).contains(&score) {
                return Err(Unavailable::Malformed(format!(
                    "prompt_injection score {} outside [0, 1]",
                    score
                )));
            }
            value.get_or_insert(score);
        }
        if let Some(result) = result {
            breakdown.entry(entry.name.clone()).or_insert(result);
        }
    }

    let value = value.ok_or_else(|| {
        Unavailable::Malformed("response has no prompt_injection score".to_string())
    })?;

    Ok(Score {
        value,
        breakdown,
        raw,
    })
}

/// Scorer backed by the remote scoring service.
pub struct DetectionGateway<T = HttpTransport> {
    transport: T,
    timeout: Duration,
    retry_backoff: Duration,
    combined: Vec<String>,
}

impl DetectionGateway<HttpTransport> {
    /// Build an HTTP gateway from configuration.
    pub fn from_config(scoring: &ScoringConfig, proxy: &ProxyConfig) -> Result<Self> {
        scoring.validate()?;
        let transport = HttpTransport::from_config(scoring, proxy.timeout())?;
        let gateway = Self::new(transport, proxy.timeout(), scoring.retry_backoff());
        if scoring.combine_detections {
            Ok(gateway.with_combined_detections(scoring.detections.clone()))
        } else {
            Ok(gateway)
        }
    }
}

impl<T: ScoringTransport> DetectionGateway<T> {
    /// Create a gateway over any transport.
    pub fn new(transport: T, timeout: Duration, retry_backoff: Duration) -> Self {
        Self {
            transport,
            timeout,
            retry_backoff,
            combined: Vec::new(),
        }
    }

    /// Score with the highest result among the named detections.
    ///
    /// `prompt_injection` must still be present and valid; other entries
    /// only raise the score, and only when their result lies in [0, 1].
    pub fn with_combined_detections(mut self, names: Vec<String>) -> Self {
        self.combined = names;
        self
    }

    fn combine(&self, mut score: Score) -> Score {
        for name in &self.combined {
            if let Some(&value) = score.breakdown.get(name) {
                if (0.0..=1.0).contains(&value) && value > score.value {
                    score.value = value;
                }
            }
        }
        score
    }

    /// The underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn attempt(
        &self,
        text: &str,
        tag: &CorrelationTag,
    ) -> std::result::Result<Score, Unavailable> {
        let response = tokio::time::timeout(self.timeout, self.transport.send(text, tag))
            .await
            .map_err(|_| Unavailable::Timeout(self.timeout))??;

        if !(200..300).contains(&response.status) {
            return Err(Unavailable::Status {
                status: response.status,
            });
        }

        parse_analysis(&response.body).map(|score| self.combine(score))
    }
}

#[async_trait]
impl<T: ScoringTransport> Scorer for DetectionGateway<T> {
    async fn score(&self, text: &str, tag: &CorrelationTag) -> std::result::Result<Score, Unavailable> {
        match self.attempt(text, tag).await {
            Err(reason) if reason.is_transient() => {
                tracing::warn!(tag = %tag, error = %reason, "Scoring attempt failed, retrying once");
                if !self.retry_backoff.is_zero() {
                    tokio::time::sleep(self.retry_backoff).await;
                }
                self.attempt(text, tag).await
            }
            other => other,
        }
    }

    fn name(&self) -> &str {
        "remote"
    }
}
