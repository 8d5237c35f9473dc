//! Match service boundary.
//!
//! The match decision itself happens remotely; this module only names the
//! request/response shapes and the status shown once a capture completes.

use crate::types::Descriptor;
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("match service unavailable: {0}")]
    Unavailable(String),
    #[error("match request failed: {0}")]
    RequestFailed(String),
    #[error("invalid match response: {0}")]
    InvalidResponse(String),
    #[error("match request timed out after {0} ms")]
    Timeout(u64),
}

/// Identity returned for a positive match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedIdentity {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
    /// Descriptor distance to the matched reference.
    pub distance: f32,
}

/// Answer from the matching service.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResponse {
    Matched {
        identity: MatchedIdentity,
        threshold: f32,
    },
    NotMatched {
        best_distance: Option<f32>,
        threshold: f32,
    },
}

/// Outcome held while a result is on screen.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchStatus {
    Matched {
        identity: MatchedIdentity,
        threshold: f32,
    },
    NotMatched {
        best_distance: Option<f32>,
        threshold: f32,
    },
    /// The request failed; nothing can be said about the face.
    NoResult { reason: String },
}

impl MatchStatus {
    pub fn summary(&self) -> String {
        match self {
            MatchStatus::Matched { identity, threshold } => format!(
                "recognized {} (dist: {:.3} | thr: {threshold})",
                identity.name, identity.distance
            ),
            MatchStatus::NotMatched {
                best_distance,
                threshold,
            } => {
                let best = best_distance
                    .map(|d| format!("{d:.3}"))
                    .unwrap_or_else(|| "n/a".to_string());
                format!("not recognized (best dist: {best} | thr: {threshold})")
            }
            MatchStatus::NoResult { reason } => format!("no result: {reason}"),
        }
    }
}

impl From<Result<MatchResponse, MatchError>> for MatchStatus {
    fn from(outcome: Result<MatchResponse, MatchError>) -> Self {
        match outcome {
            Ok(MatchResponse::Matched {
                identity,
                threshold,
            }) => MatchStatus::Matched {
                identity,
                threshold,
            },
            Ok(MatchResponse::NotMatched {
                best_distance,
                threshold,
            }) => MatchStatus::NotMatched {
                best_distance,
                threshold,
            },
            Err(e) => MatchStatus::NoResult {
                reason: e.to_string(),
            },
        }
    }
}

/// Remote descriptor matching.
pub trait MatchService: Send + Sync + 'static {
    fn find_match(
        &self,
        descriptor: &Descriptor,
    ) -> impl Future<Output = Result<MatchResponse, MatchError>> + Send;
}
