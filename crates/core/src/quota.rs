//! Quota markers recorded by the judge service.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::ModelId;

/// Quota state of one model, as last reported by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub exhausted_at: Option<DateTime<Utc>>,
    pub reset_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl QuotaState {
    pub fn exhausted_at_key(model: &ModelId) -> String {
        format!("quota_exhausted_at:{model}")
    }

    pub fn reset_at_key(model: &ModelId) -> String {
        format!("quota_reset_at:{model}")
    }

    pub fn message_key(model: &ModelId) -> String {
        format!("quota_exhausted_message:{model}")
    }

    /// Extract the markers for `model` from the service's opaque state map.
    ///
    /// Unparseable timestamps are treated as absent.
    pub fn from_state_map(model: &ModelId, state: &HashMap<String, String>) -> Self {
        let message = state
            .get(&Self::message_key(model))
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .map(str::to_string);
        Self {
            exhausted_at: state
                .get(&Self::exhausted_at_key(model))
                .and_then(|v| parse_timestamp(v)),
            reset_at: state
                .get(&Self::reset_at_key(model))
                .and_then(|v| parse_timestamp(v)),
            message,
        }
    }

    /// True when a message is recorded and the exhaustion happened within `window` before `now`.
    pub fn is_recent(&self, now: DateTime<Utc>, window: Duration) -> bool {
        if self.message.is_none() {
            return false;
        }
        match self.exhausted_at {
            Some(at) => {
                let age = now - at;
                age >= Duration::zero() && age <= window
            }
            None => false,
        }
    }
}

/// Parse a service timestamp.
///
/// Accepts RFC 3339 and naive ISO-8601 (`2024-05-01T10:00:00.123456`, UTC assumed).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}
