//! Admission decisions returned by the limiter façade.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a request was admitted or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// Within the limit of whichever backend decided
    Ok,
    /// The shared token bucket is empty
    DistributedLimit,
    /// The process-local window is full
    LocalLimit,
    /// The path is exempt from limiting
    Bypassed,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reason::Ok => "OK",
            Reason::DistributedLimit => "DISTRIBUTED_LIMIT",
            Reason::LocalLimit => "LOCAL_LIMIT",
            Reason::Bypassed => "BYPASSED",
        };
        f.write_str(name)
    }
}

/// Which path produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Distributed,
    Local,
    Bypass,
    /// The decision path failed unexpectedly and the request was let through
    FailOpen,
}

/// Verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub reason: Reason,
    pub source: DecisionSource,
}

impl RateLimitDecision {
    pub(crate) fn bypassed() -> Self {
        Self {
            allowed: true,
            reason: Reason::Bypassed,
            source: DecisionSource::Bypass,
        }
    }

    pub(crate) fn distributed(allowed: bool) -> Self {
        Self {
            allowed,
            reason: if allowed { Reason::Ok } else { Reason::DistributedLimit },
            source: DecisionSource::Distributed,
        }
    }

    pub(crate) fn local(allowed: bool) -> Self {
        Self {
            allowed,
            reason: if allowed { Reason::Ok } else { Reason::LocalLimit },
            source: DecisionSource::Local,
        }
    }

    pub(crate) fn fail_open() -> Self {
        Self {
            allowed: true,
            reason: Reason::Ok,
            source: DecisionSource::FailOpen,
        }
    }

    /// Human-readable explanation suitable for a 429 response body.
    pub fn message(&self) -> String {
        match self.reason {
            Reason::DistributedLimit => {
                "Request rate too high, please retry later (global limit reached)".to_string()
            }
            Reason::LocalLimit => {
                "Request rate too high, please retry later (instance limit reached)".to_string()
            }
            Reason::Bypassed => "Path is exempt from rate limiting".to_string(),
            Reason::Ok => "Request admitted".to_string(),
        }
    }

    /// The JSON body for a denied request, `None` when admitted.
    pub fn rejection(&self) -> Option<RejectionBody> {
        if self.allowed {
            return None;
        }

        Some(RejectionBody {
            error: "Too Many Requests".to_string(),
            message: self.message(),
        })
    }
}

/// Body of a 429 response: `{"error": "Too Many Requests", "message": ".."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
}
