//! Turns a human description of an element into something executable.
//!
//! Structural matching against the captured element lists runs first. When it
//! finds nothing, or nothing convincing, the screenshot goes to the oracle's
//! vision path and the returned coordinates are clamped to the viewport.

use crate::agent::Oracle;
use crate::types::{ActionKind, Coordinate, PageElement, PageState, Viewport};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CandidateTarget {
    Locator(String),
    Coordinate(Coordinate),
}

impl CandidateTarget {
    pub fn is_locator(&self) -> bool {
        matches!(self, CandidateTarget::Locator(_))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub target: CandidateTarget,
    pub confidence: f64,
    pub reasoning: String,
    pub element_type: String,
}

#[derive(Clone, Copy, Debug)]
pub struct ResolveContext {
    pub kind: ActionKind,
    pub viewport: Viewport,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    #[error("no element matches \"{0}\"")]
    NotFound(String),
}

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "on", "in", "into", "to", "of", "for", "and", "or", "with", "click", "press",
    "select", "type", "choose", "open",
];

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1 && !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ElementClass {
    Clickable,
    Input,
    Selectable,
}

impl ElementClass {
    fn name(&self) -> &'static str {
        match self {
            ElementClass::Clickable => "clickable",
            ElementClass::Input => "input",
            ElementClass::Selectable => "select",
        }
    }

    fn suits(&self, kind: ActionKind) -> bool {
        match kind.base() {
            ActionKind::Type => *self == ElementClass::Input,
            ActionKind::Select => *self == ElementClass::Selectable,
            ActionKind::Click | ActionKind::Hover => *self == ElementClass::Clickable,
            _ => true,
        }
    }
}

/// Scores one element against the target description. `None` when nothing matches.
fn score(phrase: &str, wanted: &[String], el: &PageElement) -> Option<(f64, String)> {
    let text = el.text.trim().to_lowercase();
    let label = std::iter::once(el.text.as_str())
        .chain(el.hints.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let (mut confidence, mut reason) = if !text.is_empty() && text == phrase {
        (0.95, "exact text match".to_string())
    } else if phrase.len() >= 3 && label.contains(phrase) {
        (0.85, "text contains the description".to_string())
    } else {
        if wanted.is_empty() {
            return None;
        }
        let have = tokens(&label);
        let matched = wanted.iter().filter(|w| have.contains(w)).count();
        if matched == 0 {
            return None;
        }
        let ratio = matched as f64 / wanted.len() as f64;
        (0.3 + 0.5 * ratio, format!("{matched}/{} words match", wanted.len()))
    };

    let selector = el.selector.to_lowercase();
    if wanted.iter().any(|w| selector.contains(w.as_str())) {
        confidence = (confidence + 0.05).min(1.0);
        reason.push_str(", selector agrees");
    }
    Some((confidence, reason))
}

fn rank(candidates: &mut [RankedCandidate]) {
    // stable: equal candidates keep discovery order
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.target.is_locator().cmp(&a.target.is_locator()))
    });
}

#[derive(Clone, Debug)]
pub struct ElementResolver {
    /// Below this, structural matches are supplemented with visual inference.
    pub low_confidence: f64,
}

impl Default for ElementResolver {
    fn default() -> Self {
        Self { low_confidence: 0.5 }
    }
}

impl ElementResolver {
    pub fn new(low_confidence: f64) -> Self {
        Self { low_confidence }
    }

    /// Structural lookup over the captured element lists.
    pub fn resolve_structural(&self, target: &str, page: &PageState, ctx: &ResolveContext) -> Vec<RankedCandidate> {
        let phrase = target.trim().to_lowercase();
        let wanted = tokens(target);
        let lists = [
            (ElementClass::Clickable, &page.clickable),
            (ElementClass::Input, &page.inputs),
            (ElementClass::Selectable, &page.selectables),
        ];
        let mut out = Vec::new();
        for (class, list) in lists {
            for el in list {
                let Some((mut confidence, mut reasoning)) = score(&phrase, &wanted, el) else {
                    continue;
                };
                if !class.suits(ctx.kind) {
                    confidence *= 0.6;
                    reasoning.push_str(&format!(", {} element for a {} action", class.name(), ctx.kind));
                }
                out.push(RankedCandidate {
                    target: CandidateTarget::Locator(el.selector.clone()),
                    confidence,
                    reasoning,
                    element_type: class.name().to_string(),
                });
            }
        }
        rank(&mut out);
        out
    }

    /// Asks the oracle's vision path for coordinates. Oracle failures yield no candidates.
    pub async fn resolve_visual<O: Oracle + ?Sized>(
        &self,
        oracle: &O,
        target: &str,
        page: &PageState,
        ctx: &ResolveContext,
    ) -> Vec<RankedCandidate> {
        let Some(shot) = page.screenshot.as_deref() else {
            debug!(target, "no screenshot, skipping visual resolution");
            return Vec::new();
        };
        let found = match oracle.locate_visually(target, page, shot).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(target, error = %e, "visual resolution reply unparseable");
                return Vec::new();
            }
            Err(e) => {
                warn!(target, error = %e, "visual resolution failed");
                return Vec::new();
            }
        };
        let mut out: Vec<RankedCandidate> = found
            .into_iter()
            .map(|c| {
                let coordinate = Coordinate {
                    x: c.x,
                    y: c.y,
                    confidence: c.confidence,
                    reasoning: c.reasoning.clone(),
                }
                .clamp_to(ctx.viewport);
                RankedCandidate {
                    target: CandidateTarget::Coordinate(coordinate),
                    confidence: c.confidence,
                    reasoning: c.reasoning,
                    element_type: c.element_type,
                }
            })
            .collect();
        rank(&mut out);
        out
    }

    /// Ranked candidates, best first. Fails rather than guessing when both
    /// strategies come back empty.
    pub async fn resolve<O: Oracle + ?Sized>(
        &self,
        oracle: &O,
        target: &str,
        page: &PageState,
        ctx: &ResolveContext,
    ) -> Result<Vec<RankedCandidate>, ResolveError> {
        let mut candidates = self.resolve_structural(target, page, ctx);
        let confident = candidates
            .first()
            .is_some_and(|c| c.confidence >= self.low_confidence);
        if !confident {
            debug!(target, structural = candidates.len(), "falling back to visual resolution");
            candidates.extend(self.resolve_visual(oracle, target, page, ctx).await);
            rank(&mut candidates);
        }
        match candidates.first() {
            Some(best) => {
                info!(target, confidence = best.confidence, locator = best.target.is_locator(), "resolved element");
                Ok(candidates)
            }
            None => Err(ResolveError::NotFound(target.to_string())),
        }
    }
}
