//! HTTP client for the remote descriptor matching API.

use faceguide_core::{Descriptor, MatchError, MatchResponse, MatchService, MatchedIdentity};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const MATCH_PATH: &str = "/userDescriptor/match";

#[derive(Serialize)]
struct MatchRequest {
    /// The descriptor as a JSON array, sent as a string.
    descriptor: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchReply {
    #[serde(rename = "match")]
    matched: Option<ReplyIdentity>,
    best_distance: Option<f32>,
    threshold: f32,
}

#[derive(Deserialize)]
struct ReplyIdentity {
    /// Numeric or string ids both occur.
    id: serde_json::Value,
    name: String,
    avatar: Option<String>,
    distance: f32,
}

impl From<MatchReply> for MatchResponse {
    fn from(reply: MatchReply) -> Self {
        match reply.matched {
            Some(identity) => MatchResponse::Matched {
                identity: MatchedIdentity {
                    id: match identity.id {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    },
                    name: identity.name,
                    avatar: identity.avatar,
                    distance: identity.distance,
                },
                threshold: reply.threshold,
            },
            None => MatchResponse::NotMatched {
                best_distance: reply.best_distance,
                threshold: reply.threshold,
            },
        }
    }
}

pub struct HttpMatchClient {
    http: Client,
    url: String,
    timeout: Duration,
}

impl HttpMatchClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MatchError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MatchError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            url: format!("{}{MATCH_PATH}", base_url.trim_end_matches('/')),
            timeout,
        })
    }

    fn classify(&self, e: reqwest::Error) -> MatchError {
        if e.is_timeout() {
            MatchError::Timeout(self.timeout.as_millis() as u64)
        } else if e.is_connect() {
            MatchError::Unavailable(e.to_string())
        } else {
            MatchError::RequestFailed(e.to_string())
        }
    }

    async fn request(&self, descriptor: &Descriptor) -> Result<MatchResponse, MatchError> {
        let body = MatchRequest {
            descriptor: serde_json::to_string(descriptor)
                .map_err(|e| MatchError::RequestFailed(format!("failed to encode descriptor: {e}")))?,
        };
        debug!(url = %self.url, dims = descriptor.len(), "sending match request");

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MatchError::RequestFailed(format!("{status}: {body}")));
        }

        let text = response.text().await.map_err(|e| self.classify(e))?;
        let reply: MatchReply =
            serde_json::from_str(&text).map_err(|e| MatchError::InvalidResponse(e.to_string()))?;
        Ok(reply.into())
    }
}

impl MatchService for HttpMatchClient {
    async fn find_match(&self, descriptor: &Descriptor) -> Result<MatchResponse, MatchError> {
        let outcome = self.request(descriptor).await;
        if let Err(e) = &outcome {
            warn!(error = %e, "match request failed");
        }
        outcome
    }
}
