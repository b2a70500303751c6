//! In-crate oracle double for component tests.

use crate::agent::Oracle;
use crate::oracle::{Decision, OracleError, OracleVerdict, Regeneration, TransportError, VisualCandidate};
use crate::parse::{ParseError, Parsed};
use crate::types::{Action, Goal, PageState, StepRecord};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

fn outage() -> OracleError {
    OracleError::Exhausted { attempts: 1, last: TransportError::Network("stub outage".into()) }
}

#[derive(Default)]
pub(crate) struct StubOracle {
    visual: Vec<VisualCandidate>,
    verdict: Option<OracleVerdict>,
    unparseable_verdicts: bool,
    failing_validation: bool,
    regeneration: Option<Regeneration>,
    visual_calls: AtomicUsize,
    validate_calls: AtomicUsize,
    regenerate_calls: AtomicUsize,
}

impl StubOracle {
    pub fn with_visual(mut self, found: Vec<VisualCandidate>) -> Self {
        self.visual = found;
        self
    }

    pub fn with_verdict(mut self, verdict: OracleVerdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    pub fn with_unparseable_verdicts(mut self) -> Self {
        self.unparseable_verdicts = true;
        self
    }

    pub fn with_failing_validation(mut self) -> Self {
        self.failing_validation = true;
        self
    }

    pub fn with_regeneration(mut self, regeneration: Regeneration) -> Self {
        self.regeneration = Some(regeneration);
        self
    }

    pub fn visual_calls(&self) -> usize {
        self.visual_calls.load(Ordering::SeqCst)
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    pub fn regenerate_calls(&self) -> usize {
        self.regenerate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Oracle for StubOracle {
    async fn decide_next_action(
        &self,
        _page: &PageState,
        _goal: &Goal,
        _history: &[StepRecord],
        _step_budget: usize,
        _step_index: usize,
    ) -> Result<Parsed<Decision>, OracleError> {
        Ok(Ok(Decision {
            action: None,
            reasoning: "stub".into(),
            confidence: 1.0,
            next_steps: Vec::new(),
        }))
    }

    async fn validate(
        &self,
        _action: &Action,
        _expected: &str,
        _before: &PageState,
        _after: &PageState,
        _evidence: Option<&[u8]>,
    ) -> Result<Parsed<OracleVerdict>, OracleError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_validation {
            return Err(outage());
        }
        if self.unparseable_verdicts {
            return Ok(Err(ParseError::NoJson));
        }
        Ok(Ok(self.verdict.clone().unwrap_or(OracleVerdict {
            success: true,
            reasoning: "looks right".into(),
            confidence: 0.9,
            success_indicators: Vec::new(),
            failure_indicators: Vec::new(),
        })))
    }

    async fn regenerate_action(
        &self,
        _failed: &Action,
        _failure_reasoning: &str,
        _page: &PageState,
        _goal: &Goal,
        _attempt: u32,
    ) -> Result<Parsed<Regeneration>, OracleError> {
        self.regenerate_calls.fetch_add(1, Ordering::SeqCst);
        match &self.regeneration {
            Some(r) => Ok(Ok(r.clone())),
            None => Err(outage()),
        }
    }

    async fn locate_visually(
        &self,
        _target: &str,
        _page: &PageState,
        _screenshot: &[u8],
    ) -> Result<Parsed<Vec<VisualCandidate>>, OracleError> {
        self.visual_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Ok(self.visual.clone()))
    }
}
