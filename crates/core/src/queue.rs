//! Queue items as shown by the triage view.

use serde::{Deserialize, Serialize};

use crate::id::ThreadId;

/// Summary of a thread in the triage queue (read-only to the orchestrator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub thread_id: ThreadId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub decision_status: Option<String>,
    /// Prior LLM suggestion, if a judgment exists.
    #[serde(default)]
    pub status_guess: Option<String>,
    #[serde(default)]
    pub confidence: Option<String>,
}

impl QueueItem {
    pub fn new(thread_id: ThreadId, title: impl Into<String>) -> Self {
        Self {
            thread_id,
            title: title.into(),
            url: None,
            decision_status: None,
            status_guess: None,
            confidence: None,
        }
    }

    pub fn with_guess(mut self, guess: impl Into<String>, confidence: impl Into<String>) -> Self {
        self.status_guess = Some(guess.into());
        self.confidence = Some(confidence.into());
        self
    }

    /// True when the LLM already produced a suggestion for this thread.
    pub fn has_guess(&self) -> bool {
        self.status_guess
            .as_deref()
            .is_some_and(|g| !g.trim().is_empty())
    }
}

/// Visibility filter on prior LLM suggestions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuessFilter {
    /// Show every item.
    #[default]
    Any,
    /// Only items with a prior suggestion.
    WithGuess,
    /// Only items still lacking a suggestion (the auto-run backlog).
    WithoutGuess,
}

impl GuessFilter {
    /// Value of the `has_llm` query parameter, if the filter restricts anything.
    pub fn has_llm_param(&self) -> Option<bool> {
        match self {
            GuessFilter::Any => None,
            GuessFilter::WithGuess => Some(true),
            GuessFilter::WithoutGuess => Some(false),
        }
    }
}

/// LLM judgment attached to a thread detail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Judgment {
    #[serde(default)]
    pub status_guess: Option<String>,
    #[serde(default)]
    pub confidence: Option<String>,
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default)]
    pub duplicates: Option<String>,
}
