use crate::agent::Oracle;
use crate::types::{Action, PageState};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const UNPARSEABLE_REASONING: &str = "validation response unparseable";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Validation {
    pub success: bool,
    pub reasoning: String,
}

impl Validation {
    fn pass(reasoning: impl Into<String>) -> Self {
        Self { success: true, reasoning: reasoning.into() }
    }

    fn fail(reasoning: impl Into<String>) -> Self {
        Self { success: false, reasoning: reasoning.into() }
    }
}

/// What changed between two captures, judged against the expected outcome.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StructuralDelta {
    pub url_changed: bool,
    pub title_changed: bool,
    pub added_text: Vec<String>,
    pub removed_text: usize,
    /// Share of the expected outcome's words now readable on the page.
    pub expected_coverage: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strength {
    /// The page changed and the expected outcome is visible.
    Strong,
    /// One of the two holds.
    Borderline,
    /// Neither holds.
    Absent,
}

const COVERAGE_THRESHOLD: f64 = 0.6;

fn outcome_terms(expected: &str) -> Vec<String> {
    expected
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .filter(|w| !matches!(*w, "the" | "and" | "should" | "will" | "now" | "with" | "for" | "are" | "page"))
        .map(str::to_string)
        .collect()
}

impl StructuralDelta {
    pub fn compute(before: &PageState, after: &PageState, expected: &str) -> Self {
        let added_text: Vec<String> = after
            .visible_text
            .iter()
            .filter(|t| !before.visible_text.contains(t))
            .cloned()
            .collect();
        let removed_text = before
            .visible_text
            .iter()
            .filter(|t| !after.visible_text.contains(t))
            .count();

        let terms = outcome_terms(expected);
        let expected_coverage = if terms.is_empty() {
            0.0
        } else {
            let readable = format!("{}\n{}", after.url.to_lowercase(), after.readable_text());
            terms.iter().filter(|t| readable.contains(t.as_str())).count() as f64 / terms.len() as f64
        };

        Self {
            url_changed: before.url != after.url,
            title_changed: before.title != after.title,
            added_text,
            removed_text,
            expected_coverage,
        }
    }

    pub fn page_changed(&self) -> bool {
        self.url_changed || self.title_changed || !self.added_text.is_empty() || self.removed_text > 0
    }

    pub fn expected_visible(&self) -> bool {
        self.expected_coverage >= COVERAGE_THRESHOLD
    }

    pub fn strength(&self) -> Strength {
        match (self.page_changed(), self.expected_visible()) {
            (true, true) => Strength::Strong,
            (false, false) => Strength::Absent,
            _ => Strength::Borderline,
        }
    }

    fn describe(&self) -> String {
        format!(
            "url changed: {}, title changed: {}, {} new text fragments, expected outcome coverage {:.0}%",
            self.url_changed,
            self.title_changed,
            self.added_text.len(),
            self.expected_coverage * 100.0
        )
    }
}

/// Judges whether an executed action did what it was meant to.
#[derive(Clone, Debug, Default)]
pub struct ValidationEngine;

impl ValidationEngine {
    pub async fn validate<O: Oracle + ?Sized>(
        &self,
        oracle: &O,
        action: &Action,
        before: &PageState,
        after: &PageState,
        expected: &str,
        evidence: Option<&[u8]>,
    ) -> Validation {
        let delta = StructuralDelta::compute(before, after, expected);
        debug!(kind = %action.kind, delta = %delta.describe(), "structural delta");

        if action.kind.is_navigation() && delta.url_changed {
            return Validation::pass(format!("navigated to {}", after.url));
        }
        if action.kind.is_passive() {
            return Validation::pass(format!("{} executed", action.kind));
        }

        let strength = delta.strength();
        let verdict = match oracle.validate(action, expected, before, after, evidence).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!(kind = %action.kind, error = %e, "validation reply unparseable");
                return Validation::fail(UNPARSEABLE_REASONING);
            }
            Err(e) => {
                warn!(kind = %action.kind, error = %e, "validation oracle unavailable, using structural verdict");
                let reasoning = format!("oracle unavailable ({e}); {}", delta.describe());
                return if strength == Strength::Strong {
                    Validation::pass(reasoning)
                } else {
                    Validation::fail(reasoning)
                };
            }
        };

        let visual = evidence.is_some();
        let visual_failure = visual && !verdict.failure_indicators.is_empty();
        let visual_success = visual && !verdict.success_indicators.is_empty();
        // visual evidence of failure beats any structural signal
        let success = if visual_failure && !verdict.success {
            false
        } else {
            match strength {
                Strength::Strong => true,
                Strength::Borderline if visual_success => true,
                _ => verdict.success,
            }
        };

        let mut reasoning = verdict.reasoning;
        if visual_failure {
            reasoning.push_str(&format!(" [visual failure: {}]", verdict.failure_indicators.join("; ")));
        }
        if success != verdict.success {
            reasoning.push_str(&format!(" [structural: {}]", delta.describe()));
        }
        info!(kind = %action.kind, success, ?strength, "validated action");
        Validation { success, reasoning }
    }
}
