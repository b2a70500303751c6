use crate::types::{Action, ActionKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Words that mark an action as gating further progress.
pub const PROGRESSION_KEYWORDS: &[&str] = &[
    "login",
    "authenticate",
    "submit",
    "confirm",
    "proceed",
    "continue",
    "next step",
    "go to",
    "access",
    "enter",
];

/// Verbs that would persist data on the target site.
pub const PERSISTING_VERBS: &[&str] = &[
    "save",
    "submit",
    "publish",
    "delete",
    "remove",
    "purchase",
    "pay",
    "place order",
    "send",
    "apply changes",
];

/// True when `keyword` occurs in `text` on word boundaries.
pub(crate) fn mentions(text: &str, keyword: &str) -> bool {
    let normalized: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();
    let haystack = format!(" {} ", normalized.join(" "));
    haystack.contains(&format!(" {} ", keyword.to_lowercase()))
}

/// Decides which failed actions end the run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// `navigate`, or a description naming an authentication or progression step.
    #[default]
    KindAndKeywords,
    /// `navigate` only, independent of oracle-written descriptions.
    KindOnly,
}

impl Criticality {
    pub fn is_critical(&self, action: &Action) -> bool {
        if action.kind == ActionKind::Navigate {
            return true;
        }
        match self {
            Criticality::KindOnly => false,
            Criticality::KindAndKeywords => {
                let description = action.description.to_lowercase();
                PROGRESSION_KEYWORDS.iter().any(|k| description.contains(k))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Containment {
    Allow,
    StopBefore(String),
}

/// Reviews each action before it reaches the browser.
#[async_trait]
pub trait ContainmentPolicy: Send + Sync {
    async fn review(&self, action: &Action) -> Containment;
}

/// Stops the run before anything that would persist data.
#[derive(Clone, Debug)]
pub struct DryRunPolicy {
    pub stop_words: Vec<String>,
}

impl Default for DryRunPolicy {
    fn default() -> Self {
        Self { stop_words: PERSISTING_VERBS.iter().map(|s| s.to_string()).collect() }
    }
}

#[async_trait]
impl ContainmentPolicy for DryRunPolicy {
    async fn review(&self, action: &Action) -> Containment {
        let committing = matches!(
            action.kind.base(),
            ActionKind::Click | ActionKind::Select | ActionKind::Evaluate
        );
        if !committing {
            return Containment::Allow;
        }
        let text = action.keyword_text();
        match self.stop_words.iter().find(|w| mentions(&text, w)) {
            Some(word) => Containment::StopBefore(format!(
                "\"{}\" would {} data",
                action.description, word
            )),
            None => Containment::Allow,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAllPolicy;

#[async_trait]
impl ContainmentPolicy for AllowAllPolicy {
    async fn review(&self, _action: &Action) -> Containment {
        Containment::Allow
    }
}
