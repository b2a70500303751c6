//! Scripted collaborators for driving the agent without a browser or a model.
#![allow(dead_code)]

use async_trait::async_trait;
use demo_pilot::oracle::{Decision, OracleError, OracleVerdict, Regeneration, TransportError, VisualCandidate};
use demo_pilot::parse::{ParseError, Parsed};
use demo_pilot::types::{PageElement, ScreenPosition};
use demo_pilot::{Action, ActionOutcome, AgentError, Computer, Goal, Oracle, PageState, RunResult, StepRecord};
use demo_pilot::RunRecorder;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const ORIGIN: &str = "https://app.test/";

pub fn goal() -> Goal {
    Goal::from_task("Demonstrate exporting a report", ORIGIN)
        .with_feature_name("Export")
        .with_instructions("1. Click Export\n2. Name the file\n3. Click Save")
}

fn outage() -> OracleError {
    OracleError::Exhausted { attempts: 3, last: TransportError::RateLimited("429".into()) }
}

// ========================= Computer =========================

#[derive(Default)]
struct World {
    initialized: bool,
    shut_down: bool,
    url: String,
    visible: Vec<String>,
    performed: Vec<Action>,
}

/// A tiny fake app. Successful actions leave a visible trace on the page;
/// actions keyed (by locator, else value) in `failing` always fail, and
/// actions keyed in `inert` succeed without changing anything.
#[derive(Default)]
pub struct ScriptedComputer {
    world: Mutex<World>,
    failing: HashSet<String>,
    inert: HashSet<String>,
    slow_once: Mutex<HashSet<String>>,
    delay: Duration,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl ScriptedComputer {
    pub fn failing(mut self, key: &str) -> Self {
        self.failing.insert(key.to_string());
        self
    }

    pub fn inert(mut self, key: &str) -> Self {
        self.inert.insert(key.to_string());
        self
    }

    /// The first attempt on `key` stalls for `delay`.
    pub fn slow_once(self, key: &str, delay: Duration) -> Self {
        self.slow_once.lock().unwrap().insert(key.to_string());
        Self { delay, ..self }
    }

    /// Cancels `token` as the `n`th action is performed.
    pub fn cancel_after(mut self, n: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((n, token));
        self
    }

    pub fn performed(&self) -> Vec<Action> {
        self.world.lock().unwrap().performed.clone()
    }

    pub fn performed_on(&self, key: &str) -> usize {
        self.performed()
            .iter()
            .filter(|a| key_of(a) == key)
            .count()
    }

    pub fn shut_down(&self) -> bool {
        self.world.lock().unwrap().shut_down
    }
}

fn key_of(action: &Action) -> String {
    action
        .locator
        .clone()
        .or_else(|| action.value.clone())
        .unwrap_or_default()
}

#[async_trait]
impl Computer for ScriptedComputer {
    async fn initialize(&self) -> Result<(), AgentError> {
        let mut w = self.world.lock().unwrap();
        w.initialized = true;
        w.url = "about:blank".into();
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), AgentError> {
        let mut w = self.world.lock().unwrap();
        if !w.initialized {
            return Err(AgentError::NotInitialized);
        }
        w.url = url.to_string();
        Ok(())
    }

    async fn perform_action(&self, action: &Action) -> Result<ActionOutcome, AgentError> {
        let key = key_of(action);
        let slow = self.slow_once.lock().unwrap().remove(&key);
        if slow {
            tokio::time::sleep(self.delay).await;
        }
        let mut w = self.world.lock().unwrap();
        if !w.initialized {
            return Err(AgentError::NotInitialized);
        }
        w.performed.push(action.clone());
        if let Some((n, token)) = &self.cancel_after {
            if w.performed.len() >= *n {
                token.cancel();
            }
        }
        if self.failing.contains(&key) {
            return Ok(ActionOutcome::failed(format!("{key} is broken")));
        }
        if self.inert.contains(&key) {
            return Ok(ActionOutcome::ok());
        }
        match action.value.as_deref() {
            Some(url) if action.kind == demo_pilot::ActionKind::Navigate => w.url = url.to_string(),
            _ => {
                let trace = format!("done: {}", action.description);
                w.visible.push(trace);
            }
        }
        Ok(ActionOutcome::ok())
    }

    async fn capture_state(&self, _with_screenshot: bool) -> Result<PageState, AgentError> {
        let w = self.world.lock().unwrap();
        if !w.initialized {
            return Err(AgentError::NotInitialized);
        }
        Ok(PageState {
            url: w.url.clone(),
            title: "Reports".into(),
            visible_text: w.visible.clone(),
            clickable: vec![
                PageElement::new("#export", "Export"),
                PageElement::new("#save", "Save"),
                PageElement::new("a.reports", "Reports"),
            ],
            inputs: vec![PageElement::new("input[name=filename]", "").with_hint("File name")],
            ..Default::default()
        })
    }

    async fn locate_on_screen(&self, locator: &str) -> Result<Option<ScreenPosition>, AgentError> {
        Ok(match locator {
            "#export" => Some(ScreenPosition { x: 40.0, y: 12.0 }),
            _ => None,
        })
    }

    async fn shutdown(&self) -> Result<(), AgentError> {
        self.world.lock().unwrap().shut_down = true;
        Ok(())
    }
}

// ========================= Oracle =========================

/// Replays queued decisions, then keeps repeating `repeat` (or reports done).
/// Verdicts are replayed from `verdicts` and approve once the queue is empty.
#[derive(Default)]
pub struct ScriptedOracle {
    decisions: Mutex<VecDeque<Result<Parsed<Decision>, OracleError>>>,
    verdicts: Mutex<VecDeque<bool>>,
    rejects_all: bool,
    repeat: Option<Action>,
    regeneration: Option<Action>,
    stalled_decisions: Mutex<usize>,
    stall: Duration,
    decide_calls: AtomicUsize,
    validate_calls: AtomicUsize,
    regenerate_calls: AtomicUsize,
}

pub fn decide(action: Action) -> Result<Parsed<Decision>, OracleError> {
    Ok(Ok(Decision {
        action: Some(action),
        reasoning: "next documented step".into(),
        confidence: 0.9,
        next_steps: Vec::new(),
    }))
}

pub fn done() -> Result<Parsed<Decision>, OracleError> {
    Ok(Ok(Decision {
        action: None,
        reasoning: "feature demonstrated".into(),
        confidence: 0.9,
        next_steps: Vec::new(),
    }))
}

pub fn garbled() -> Result<Parsed<Decision>, OracleError> {
    Ok(Err(ParseError::NoJson))
}

pub fn unreachable_oracle() -> Result<Parsed<Decision>, OracleError> {
    Err(outage())
}

impl ScriptedOracle {
    pub fn new(script: Vec<Result<Parsed<Decision>, OracleError>>) -> Self {
        Self { decisions: Mutex::new(script.into()), ..Default::default() }
    }

    pub fn repeating(mut self, action: Action) -> Self {
        self.repeat = Some(action);
        self
    }

    pub fn regenerating(mut self, action: Action) -> Self {
        self.regeneration = Some(action);
        self
    }

    pub fn judging(self, verdicts: Vec<bool>) -> Self {
        Self { verdicts: Mutex::new(verdicts.into()), ..self }
    }

    pub fn rejecting_everything(mut self) -> Self {
        self.rejects_all = true;
        self
    }

    /// The first `n` decisions stall for `delay` before answering.
    pub fn stalling(self, n: usize, delay: Duration) -> Self {
        Self { stalled_decisions: Mutex::new(n), stall: delay, ..self }
    }

    pub fn decide_calls(&self) -> usize {
        self.decide_calls.load(Ordering::SeqCst)
    }

    pub fn regenerate_calls(&self) -> usize {
        self.regenerate_calls.load(Ordering::SeqCst)
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn decide_next_action(
        &self,
        _page: &PageState,
        _goal: &Goal,
        _history: &[StepRecord],
        _step_budget: usize,
        _step_index: usize,
    ) -> Result<Parsed<Decision>, OracleError> {
        self.decide_calls.fetch_add(1, Ordering::SeqCst);
        let stalls = {
            let mut left = self.stalled_decisions.lock().unwrap();
            let stalls = *left > 0;
            *left = left.saturating_sub(1);
            stalls
        };
        if stalls {
            tokio::time::sleep(self.stall).await;
        }
        if let Some(next) = self.decisions.lock().unwrap().pop_front() {
            return next;
        }
        match &self.repeat {
            Some(action) => decide(action.clone()),
            None => done(),
        }
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
        let scripted = self.verdicts.lock().unwrap().pop_front();
        let success = scripted.unwrap_or(!self.rejects_all);
        Ok(Ok(OracleVerdict {
            success,
            reasoning: if success { "visible change".into() } else { "nothing happened on screen".into() },
            confidence: 0.8,
            success_indicators: Vec::new(),
            failure_indicators: Vec::new(),
        }))
    }

    async fn regenerate_action(
        &self,
        _failed: &Action,
        failure_reasoning: &str,
        _page: &PageState,
        _goal: &Goal,
        _attempt: u32,
    ) -> Result<Parsed<Regeneration>, OracleError> {
        self.regenerate_calls.fetch_add(1, Ordering::SeqCst);
        match &self.regeneration {
            Some(action) => Ok(Ok(Regeneration {
                action: action.clone(),
                reasoning: format!("retry after: {failure_reasoning}"),
                recommendations: Vec::new(),
            })),
            None => Err(outage()),
        }
    }

    async fn locate_visually(
        &self,
        _target: &str,
        _page: &PageState,
        _screenshot: &[u8],
    ) -> Result<Parsed<Vec<VisualCandidate>>, OracleError> {
        Ok(Ok(Vec::new()))
    }
}

// ========================= Recorder =========================

#[derive(Default)]
pub struct MemoryRecorder {
    pub started: AtomicUsize,
    pub steps: Mutex<Vec<usize>>,
    pub finished: Mutex<Option<RunResult>>,
}

#[async_trait]
impl RunRecorder for MemoryRecorder {
    async fn run_started(&self, _run_id: &str, _goal: &Goal) -> Result<(), AgentError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn step_recorded(&self, _run_id: &str, step: &StepRecord, _screenshot: Option<&[u8]>) -> Result<(), AgentError> {
        self.steps.lock().unwrap().push(step.order);
        Err(AgentError::Recorder("disk full".into()))
    }

    async fn run_finished(&self, _run_id: &str, result: &RunResult) -> Result<(), AgentError> {
        *self.finished.lock().unwrap() = Some(result.clone());
        Ok(())
    }
}
