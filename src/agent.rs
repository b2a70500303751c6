use crate::oracle::{Decision, OracleError, OracleVerdict, Regeneration, VisualCandidate};
use crate::parse::Parsed;
use crate::policy::{Containment, ContainmentPolicy, Criticality, DryRunPolicy};
use crate::recorder::{NullRecorder, RunRecorder};
use crate::recovery::{RecoveryPlan, RecoveryPlanner};
use crate::resolver::{CandidateTarget, ElementResolver, ResolveContext};
use crate::types::{
    now_ms, Action, Goal, PageState, RunOutcome, RunResult, RunSummary, ScreenPosition, StepRecord,
};
use crate::validation::ValidationEngine;
use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ========================= Errors =========================

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum AgentError {
    #[error("automation surface error: {0}")]
    Computer(String),
    #[error("automation surface not initialized")]
    NotInitialized,
    #[error("oracle error: {0}")]
    Oracle(String),
    #[error("element resolution failed: {0}")]
    Resolution(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("recorder error: {0}")]
    Recorder(String),
}

impl From<OracleError> for AgentError {
    fn from(e: OracleError) -> Self {
        AgentError::Oracle(e.to_string())
    }
}

// ========================= Pluggable Subsystems =========================

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// Text produced by `extract` and `evaluate`.
    pub output: Option<String>,
}

impl ActionOutcome {
    pub fn ok() -> Self {
        Self { success: true, ..Default::default() }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), output: None }
    }
}

/// The live page the agent drives. Every method other than `initialize`
/// must fail with [`AgentError::NotInitialized`] before `initialize` ran.
#[async_trait]
pub trait Computer: Send + Sync {
    async fn initialize(&self) -> Result<(), AgentError>;
    async fn navigate(&self, url: &str) -> Result<(), AgentError>;
    async fn perform_action(&self, action: &Action) -> Result<ActionOutcome, AgentError>;
    async fn capture_state(&self, with_screenshot: bool) -> Result<PageState, AgentError>;
    async fn locate_on_screen(&self, locator: &str) -> Result<Option<ScreenPosition>, AgentError>;
    async fn shutdown(&self) -> Result<(), AgentError>;
}

/// The decision oracle. Unparseable replies come back as `Ok(Err(_))`;
/// `Err` is reserved for transport failures that survived credential rotation.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn decide_next_action(
        &self,
        page: &PageState,
        goal: &Goal,
        history: &[StepRecord],
        step_budget: usize,
        step_index: usize,
    ) -> Result<Parsed<Decision>, OracleError>;

    async fn validate(
        &self,
        action: &Action,
        expected: &str,
        before: &PageState,
        after: &PageState,
        evidence: Option<&[u8]>,
    ) -> Result<Parsed<OracleVerdict>, OracleError>;

    async fn regenerate_action(
        &self,
        failed: &Action,
        failure_reasoning: &str,
        page: &PageState,
        goal: &Goal,
        attempt: u32,
    ) -> Result<Parsed<Regeneration>, OracleError>;

    async fn locate_visually(
        &self,
        target: &str,
        page: &PageState,
        screenshot: &[u8],
    ) -> Result<Parsed<Vec<VisualCandidate>>, OracleError>;
}

#[async_trait]
impl<T: Oracle + ?Sized> Oracle for Arc<T> {
    async fn decide_next_action(
        &self,
        page: &PageState,
        goal: &Goal,
        history: &[StepRecord],
        step_budget: usize,
        step_index: usize,
    ) -> Result<Parsed<Decision>, OracleError> {
        (**self).decide_next_action(page, goal, history, step_budget, step_index).await
    }

    async fn validate(
        &self,
        action: &Action,
        expected: &str,
        before: &PageState,
        after: &PageState,
        evidence: Option<&[u8]>,
    ) -> Result<Parsed<OracleVerdict>, OracleError> {
        (**self).validate(action, expected, before, after, evidence).await
    }

    async fn regenerate_action(
        &self,
        failed: &Action,
        failure_reasoning: &str,
        page: &PageState,
        goal: &Goal,
        attempt: u32,
    ) -> Result<Parsed<Regeneration>, OracleError> {
        (**self).regenerate_action(failed, failure_reasoning, page, goal, attempt).await
    }

    async fn locate_visually(
        &self,
        target: &str,
        page: &PageState,
        screenshot: &[u8],
    ) -> Result<Parsed<Vec<VisualCandidate>>, OracleError> {
        (**self).locate_visually(target, page, screenshot).await
    }
}

#[async_trait]
impl<T: Computer + ?Sized> Computer for Arc<T> {
    async fn initialize(&self) -> Result<(), AgentError> {
        (**self).initialize().await
    }

    async fn navigate(&self, url: &str) -> Result<(), AgentError> {
        (**self).navigate(url).await
    }

    async fn perform_action(&self, action: &Action) -> Result<ActionOutcome, AgentError> {
        (**self).perform_action(action).await
    }

    async fn capture_state(&self, with_screenshot: bool) -> Result<PageState, AgentError> {
        (**self).capture_state(with_screenshot).await
    }

    async fn locate_on_screen(&self, locator: &str) -> Result<Option<ScreenPosition>, AgentError> {
        (**self).locate_on_screen(locator).await
    }

    async fn shutdown(&self) -> Result<(), AgentError> {
        (**self).shutdown().await
    }
}

// ========================= Agent Core =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub step_budget: usize,
    /// Recoveries allowed per action before it is marked failed.
    pub max_retries: u32,
    /// Bound on each browser call.
    pub step_timeout: Duration,
    /// Bound on each oracle-backed phase, credential rotation included.
    pub oracle_timeout: Duration,
    pub capture_screenshots: bool,
    pub criticality: Criticality,
    pub max_unparseable_decisions: u32,
    /// Structural matches below this also consult the vision path.
    pub low_confidence: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            step_budget: 20,
            max_retries: 3,
            step_timeout: Duration::from_secs(30),
            oracle_timeout: Duration::from_secs(120),
            capture_screenshots: true,
            criticality: Criticality::KindAndKeywords,
            max_unparseable_decisions: 3,
            low_confidence: 0.5,
        }
    }
}

/// One action in flight, carried through Resolving → Executing → Validating
/// and around the Recovering loop.
#[derive(Debug)]
struct Attempt {
    original: Action,
    action: Action,
    retries: u32,
    failure: Option<String>,
    output: Option<String>,
    before: Option<PageState>,
    after: Option<PageState>,
}

impl Attempt {
    fn new(action: Action) -> Self {
        Self {
            original: action.clone(),
            action,
            retries: 0,
            failure: None,
            output: None,
            before: None,
            after: None,
        }
    }

    fn record(&self, success: bool, error: Option<String>, position: Option<ScreenPosition>) -> StepRecord {
        let mut action = self.action.clone();
        if let Some(out) = &self.output {
            action.annotate("output", out.clone());
        }
        StepRecord {
            order: 0,
            locator: action.locator.clone(),
            coordinate: action.coordinate.clone(),
            description: action.description.clone(),
            tooltip: Some(action.tooltip().unwrap_or_else(|| action.description.clone())),
            position,
            url: self.after.as_ref().map(|p| p.url.clone()),
            captured_at_ms: now_ms(),
            success,
            error,
            attempts: self.retries,
            action,
        }
    }
}

#[derive(Debug)]
enum Phase {
    Initializing,
    Analyzing,
    Resolving(Attempt),
    Executing(Attempt),
    Validating(Attempt),
    Recovering(Attempt),
    Completing(RunOutcome),
    Erroring(String),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Initializing => "initializing",
            Phase::Analyzing => "analyzing",
            Phase::Resolving(_) => "resolving",
            Phase::Executing(_) => "executing",
            Phase::Validating(_) => "validating",
            Phase::Recovering(_) => "recovering",
            Phase::Completing(_) => "completing",
            Phase::Erroring(_) => "erroring",
        }
    }
}

/// Mutable control-loop state, owned by a single run.
struct RunState {
    run_id: String,
    step_index: usize,
    step_budget: usize,
    steps: Vec<StepRecord>,
    last_page: Option<PageState>,
    is_complete: bool,
    error: Option<String>,
    started_at_ms: u128,
    ended_at_ms: Option<u128>,
    unusable_decisions: u32,
    stopped_before: Option<String>,
}

impl RunState {
    fn new(run_id: String, step_budget: usize) -> Self {
        Self {
            run_id,
            step_index: 0,
            step_budget,
            steps: Vec::new(),
            last_page: None,
            is_complete: false,
            error: None,
            started_at_ms: now_ms(),
            ended_at_ms: None,
            unusable_decisions: 0,
            stopped_before: None,
        }
    }

    fn budget_spent(&self) -> bool {
        self.step_index >= self.step_budget
    }

    /// Appends the record for the current iteration and advances the index.
    fn append(&mut self, mut record: StepRecord) -> &StepRecord {
        debug_assert!(!self.is_complete, "step appended after completion");
        self.step_index += 1;
        record.order = self.step_index;
        self.steps.push(record);
        &self.steps[self.steps.len() - 1]
    }

    fn finish(&mut self, error: Option<String>) {
        self.is_complete = true;
        self.error = error;
        self.ended_at_ms = Some(now_ms());
    }
}

async fn bounded<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T, AgentError>>,
) -> Result<T, AgentError> {
    match timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(AgentError::Timeout(format!("{what} did not finish within {limit:?}"))),
    }
}

pub struct Agent<C, O, P>
where
    C: Computer,
    O: Oracle,
    P: ContainmentPolicy,
{
    computer: C,
    oracle: O,
    policy: P,
    cfg: AgentConfig,
    resolver: ElementResolver,
    validator: ValidationEngine,
    planner: RecoveryPlanner,
    recorder: Arc<dyn RunRecorder>, // optional sink for the audit trail
}

impl<C, O, P> Agent<C, O, P>
where
    C: Computer,
    O: Oracle,
    P: ContainmentPolicy,
{
    pub fn new(computer: C, oracle: O, policy: P, cfg: AgentConfig) -> Self {
        Self {
            resolver: ElementResolver::new(cfg.low_confidence),
            validator: ValidationEngine,
            planner: RecoveryPlanner::new(cfg.max_retries, cfg.criticality),
            computer,
            oracle,
            policy,
            cfg,
            recorder: Arc::new(NullRecorder),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn RunRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub async fn run(&self, goal: &Goal) -> RunResult {
        self.run_with_cancel(goal, CancellationToken::new()).await
    }

    /// Drives one run to completion. Never fails: every outcome, including
    /// cancellation and fatal errors, is reported in the returned result
    /// together with the steps recorded so far.
    pub async fn run_with_cancel(&self, goal: &Goal, cancel: CancellationToken) -> RunResult {
        let started = Instant::now();
        let mut run = RunState::new(nanoid!(), self.cfg.step_budget);
        info!(run_id = %run.run_id, feature = %goal.feature_name, budget = run.step_budget, "run started");
        if let Err(e) = self.recorder.run_started(&run.run_id, goal).await {
            warn!(run_id = %run.run_id, error = %e, "recorder failed");
        }

        let mut phase = Phase::Initializing;
        loop {
            debug!(run_id = %run.run_id, phase = phase.name(), step = run.step_index, "transition");
            phase = match phase {
                Phase::Initializing => self.initialize(goal, &mut run).await,
                Phase::Analyzing => self.analyze(goal, &mut run, &cancel).await,
                Phase::Resolving(attempt) => self.resolve(attempt, &run).await,
                Phase::Executing(attempt) => self.execute(attempt, &mut run, &cancel).await,
                Phase::Validating(attempt) => self.validate(attempt, goal, &mut run, &cancel).await,
                Phase::Recovering(attempt) => self.recover(attempt, goal, &mut run).await,
                Phase::Completing(outcome) => return self.complete(goal, run, outcome, started).await,
                Phase::Erroring(message) => return self.fail(goal, run, message, started).await,
            };
        }
    }

    async fn capture(&self) -> Result<PageState, AgentError> {
        bounded(
            self.cfg.step_timeout,
            "page capture",
            self.computer.capture_state(self.cfg.capture_screenshots),
        )
        .await
    }

    async fn initialize(&self, goal: &Goal, run: &mut RunState) -> Phase {
        if let Err(e) = bounded(self.cfg.step_timeout, "browser start", self.computer.initialize()).await {
            return Phase::Erroring(format!("automation surface unavailable: {e}"));
        }
        let mut page = match self.capture().await {
            Ok(p) => p,
            Err(e) => return Phase::Erroring(format!("initial page capture failed: {e}")),
        };
        if !goal.origin.is_empty() && !page.url.starts_with(&goal.origin) {
            info!(origin = %goal.origin, current = %page.url, "opening target site");
            if let Err(e) = bounded(self.cfg.step_timeout, "navigation", self.computer.navigate(&goal.origin)).await {
                return Phase::Erroring(format!("could not open {}: {e}", goal.origin));
            }
            page = match self.capture().await {
                Ok(p) => p,
                Err(e) => return Phase::Erroring(format!("initial page capture failed: {e}")),
            };
        }
        run.last_page = Some(page);
        Phase::Analyzing
    }

    async fn analyze(&self, goal: &Goal, run: &mut RunState, cancel: &CancellationToken) -> Phase {
        if cancel.is_cancelled() {
            return Phase::Completing(RunOutcome::Cancelled);
        }
        if run.budget_spent() {
            return Phase::Completing(RunOutcome::BudgetExhausted);
        }
        let Some(page) = run.last_page.as_ref() else {
            return Phase::Erroring("no page state captured".into());
        };

        let decided = bounded(self.cfg.oracle_timeout, "decision oracle", async {
            self.oracle
                .decide_next_action(page, goal, &run.steps, run.step_budget, run.step_index)
                .await
                .map_err(AgentError::from)
        })
        .await;
        let decision = match decided {
            Ok(Ok(d)) => d,
            Ok(Err(e)) => return self.unusable_decision(run, format!("unparseable decision: {e}")),
            Err(AgentError::Timeout(msg)) => return self.unusable_decision(run, msg),
            Err(e) => return Phase::Erroring(format!("decision oracle unavailable: {e}")),
        };
        run.unusable_decisions = 0;

        let Some(action) = decision.action else {
            info!(reasoning = %decision.reasoning, steps = run.steps.len(), "oracle reports the goal complete");
            return if run.steps.is_empty() {
                Phase::Completing(RunOutcome::ZeroProgress)
            } else {
                Phase::Completing(RunOutcome::GoalReached)
            };
        };
        info!(
            step = run.step_index + 1,
            kind = %action.kind,
            description = %action.description,
            confidence = decision.confidence,
            "next action"
        );
        if let Some(phase) = self.contain(&action, run).await {
            return phase;
        }
        Phase::Resolving(Attempt::new(action))
    }

    fn unusable_decision(&self, run: &mut RunState, reason: String) -> Phase {
        run.unusable_decisions += 1;
        warn!(count = run.unusable_decisions, reason = %reason, "decision unusable");
        if run.unusable_decisions >= self.cfg.max_unparseable_decisions {
            Phase::Erroring(format!(
                "no usable decision after {} attempts: {reason}",
                run.unusable_decisions
            ))
        } else {
            Phase::Analyzing
        }
    }

    /// `Some(Completing)` when the policy withholds `action`.
    async fn contain(&self, action: &Action, run: &mut RunState) -> Option<Phase> {
        match self.policy.review(action).await {
            Containment::Allow => None,
            Containment::StopBefore(reason) => {
                info!(reason = %reason, "dry run: stopping before persisting action");
                run.stopped_before = Some(action.description.clone());
                Some(Phase::Completing(RunOutcome::DryRunStop))
            }
        }
    }

    async fn resolve(&self, mut attempt: Attempt, run: &RunState) -> Phase {
        if !attempt.action.needs_resolution() {
            return Phase::Executing(attempt);
        }
        let Some(page) = run.last_page.as_ref() else {
            return Phase::Erroring("no page state captured".into());
        };
        let target = attempt.action.target_description().to_string();
        let ctx = ResolveContext { kind: attempt.action.kind, viewport: page.viewport };
        let resolved = bounded(self.cfg.oracle_timeout, "element resolution", async {
            self.resolver
                .resolve(&self.oracle, &target, page, &ctx)
                .await
                .map_err(|e| AgentError::Resolution(e.to_string()))
        })
        .await;

        let best = match resolved.map(|c| c.into_iter().next()) {
            Ok(Some(best)) => best,
            Ok(None) => {
                attempt.failure = Some(format!("no candidates for \"{target}\""));
                return Phase::Recovering(attempt);
            }
            Err(e) => {
                attempt.failure = Some(e.to_string());
                return Phase::Recovering(attempt);
            }
        };
        debug!(target = %target, confidence = best.confidence, reasoning = %best.reasoning, "applying candidate");
        match best.target {
            CandidateTarget::Locator(selector) => attempt.action.locator = Some(selector),
            CandidateTarget::Coordinate(c) => {
                attempt.action.kind = attempt.action.kind.at_variant();
                attempt.action.coordinate = Some(c);
            }
        }
        Phase::Executing(attempt)
    }

    async fn execute(&self, mut attempt: Attempt, run: &mut RunState, cancel: &CancellationToken) -> Phase {
        if cancel.is_cancelled() {
            return Phase::Completing(RunOutcome::Cancelled);
        }
        // a resolved locator may reveal what the description did not
        let mut contained = None;
        if attempt.action.locator != attempt.original.locator {
            contained = self.contain(&attempt.action, run).await;
        }
        if let Some(phase) = contained {
            return phase;
        }

        attempt.before = run.last_page.clone();
        let performed = bounded(
            self.cfg.step_timeout,
            "browser action",
            self.computer.perform_action(&attempt.action),
        )
        .await;
        let failure = match performed {
            Ok(outcome) if outcome.success => {
                attempt.output = outcome.output;
                None
            }
            Ok(outcome) => Some(
                outcome
                    .error
                    .unwrap_or_else(|| format!("{} reported failure", attempt.action.kind)),
            ),
            Err(AgentError::NotInitialized) => {
                return Phase::Erroring("automation surface not initialized".into());
            }
            Err(e) => Some(e.to_string()),
        };

        match self.capture().await {
            Ok(after) => {
                run.last_page = Some(after.clone());
                attempt.after = Some(after);
            }
            Err(e) => {
                warn!(error = %e, "page capture after action failed");
                if failure.is_none() {
                    attempt.failure = Some(format!("page capture after action failed: {e}"));
                    return Phase::Recovering(attempt);
                }
            }
        }
        if let Some(reason) = failure {
            warn!(kind = %attempt.action.kind, reason = %reason, "action failed");
            attempt.failure = Some(reason);
            return Phase::Recovering(attempt);
        }
        Phase::Validating(attempt)
    }

    async fn validate(&self, mut attempt: Attempt, goal: &Goal, run: &mut RunState, cancel: &CancellationToken) -> Phase {
        if cancel.is_cancelled() {
            return Phase::Completing(RunOutcome::Cancelled);
        }
        let (Some(before), Some(after)) = (attempt.before.as_ref(), attempt.after.as_ref()) else {
            attempt.failure = Some("missing page capture around the action".into());
            return Phase::Recovering(attempt);
        };
        let expected = attempt
            .action
            .expected_outcome()
            .or_else(|| goal.expected_for(run.step_index))
            .unwrap_or(attempt.action.description.as_str())
            .to_string();
        let evidence = if self.cfg.capture_screenshots {
            after.screenshot.as_deref()
        } else {
            None
        };
        let validated = bounded(self.cfg.oracle_timeout, "validation", async {
            Ok(self
                .validator
                .validate(&self.oracle, &attempt.action, before, after, &expected, evidence)
                .await)
        })
        .await;

        match validated {
            Ok(v) if v.success => {
                let position = self.position_of(&attempt.action).await;
                let record = attempt.record(true, None, position);
                self.append_step(run, record, evidence).await;
                info!(step = run.step_index, reasoning = %v.reasoning, "step succeeded");
                if run.budget_spent() {
                    Phase::Completing(RunOutcome::BudgetExhausted)
                } else {
                    Phase::Analyzing
                }
            }
            Ok(v) => {
                attempt.failure = Some(v.reasoning);
                Phase::Recovering(attempt)
            }
            Err(e) => {
                attempt.failure = Some(e.to_string());
                Phase::Recovering(attempt)
            }
        }
    }

    async fn recover(&self, mut attempt: Attempt, goal: &Goal, run: &mut RunState) -> Phase {
        let reason = attempt
            .failure
            .clone()
            .unwrap_or_else(|| "unknown failure".to_string());
        if attempt.retries >= self.cfg.max_retries {
            return self.give_up(attempt, reason, run).await;
        }
        let Some(page) = run.last_page.clone() else {
            return Phase::Erroring("no page state captured".into());
        };

        attempt.retries += 1;
        info!(attempt = attempt.retries, kind = %attempt.action.kind, reason = %reason, "recovering");
        let planned = bounded(self.cfg.oracle_timeout, "recovery oracle", async {
            Ok(self
                .planner
                .plan(&self.oracle, &attempt.action, &reason, &page, goal, attempt.retries)
                .await)
        })
        .await;
        let plan = match planned {
            Ok(plan) => plan,
            Err(e) => self
                .planner
                .fallback(&attempt.action, &reason, attempt.retries, &e.to_string()),
        };

        match plan {
            RecoveryPlan::Abort { reason } => {
                let record = attempt.record(false, Some(reason.clone()), None);
                self.append_step(run, record, None).await;
                Phase::Erroring(reason)
            }
            RecoveryPlan::Retry { action, reasoning, degraded, .. } => {
                debug!(reasoning = %reasoning, degraded, "retrying with new action");
                if let Containment::StopBefore(why) = self.policy.review(&action).await {
                    info!(reason = %why, "dry run: recovery proposed a persisting action");
                    let record = attempt.record(false, Some(reason), None);
                    self.append_step(run, record, None).await;
                    run.stopped_before = Some(action.description.clone());
                    return Phase::Completing(RunOutcome::DryRunStop);
                }
                attempt.action = action;
                attempt.failure = None;
                attempt.output = None;
                attempt.before = None;
                attempt.after = None;
                Phase::Resolving(attempt)
            }
        }
    }

    async fn give_up(&self, attempt: Attempt, reason: String, run: &mut RunState) -> Phase {
        let critical =
            self.planner.is_critical(&attempt.original) || self.planner.is_critical(&attempt.action);
        let record = attempt.record(false, Some(reason.clone()), None);
        let shot = attempt.after.as_ref().and_then(|p| p.screenshot.as_deref());
        self.append_step(run, record, shot).await;
        if critical {
            warn!(step = run.step_index, reason = %reason, "critical action failed, stopping run");
            return Phase::Erroring(format!(
                "critical action \"{}\" failed after {} retries: {reason}",
                attempt.action.description, attempt.retries
            ));
        }
        warn!(step = run.step_index, reason = %reason, "skipping failed action");
        if run.budget_spent() {
            Phase::Completing(RunOutcome::BudgetExhausted)
        } else {
            Phase::Analyzing
        }
    }

    async fn position_of(&self, action: &Action) -> Option<ScreenPosition> {
        if let Some(c) = &action.coordinate {
            return Some(ScreenPosition { x: c.x, y: c.y });
        }
        let locator = action.locator.as_deref()?;
        match bounded(self.cfg.step_timeout, "locate on screen", self.computer.locate_on_screen(locator)).await {
            Ok(position) => position,
            Err(e) => {
                debug!(locator, error = %e, "no screen position");
                None
            }
        }
    }

    async fn append_step(&self, run: &mut RunState, record: StepRecord, screenshot: Option<&[u8]>) {
        let run_id = run.run_id.clone();
        let record = run.append(record);
        if let Err(e) = self.recorder.step_recorded(&run_id, record, screenshot).await {
            warn!(run_id = %run_id, error = %e, "recorder failed");
        }
    }

    async fn release(&self) {
        if let Err(e) = bounded(self.cfg.step_timeout, "browser shutdown", self.computer.shutdown()).await {
            warn!(error = %e, "automation surface did not shut down cleanly");
        }
    }

    async fn complete(&self, goal: &Goal, mut run: RunState, outcome: RunOutcome, started: Instant) -> RunResult {
        let any_success = run.steps.iter().any(|s| s.success);
        let success = match outcome {
            RunOutcome::GoalReached => true,
            RunOutcome::DryRunStop => !run.steps.is_empty(),
            RunOutcome::BudgetExhausted => any_success,
            RunOutcome::ZeroProgress | RunOutcome::Cancelled | RunOutcome::Failed => false,
        };
        let error = match outcome {
            RunOutcome::ZeroProgress => Some("oracle reported completion before any step was performed".to_string()),
            RunOutcome::Cancelled => Some("cancelled".to_string()),
            RunOutcome::BudgetExhausted if !success => Some(format!(
                "step budget of {} exhausted without a successful step",
                run.step_budget
            )),
            RunOutcome::DryRunStop if !success => Some("dry run stopped before the first step".to_string()),
            _ => None,
        };
        run.finish(error.clone());
        self.release().await;
        self.report(goal, run, outcome, success, error, started).await
    }

    async fn fail(&self, goal: &Goal, mut run: RunState, message: String, started: Instant) -> RunResult {
        warn!(run_id = %run.run_id, error = %message, steps = run.steps.len(), "run failed");
        run.finish(Some(message.clone()));
        self.release().await;
        self.report(goal, run, RunOutcome::Failed, false, Some(message), started).await
    }

    async fn report(
        &self,
        goal: &Goal,
        run: RunState,
        outcome: RunOutcome,
        success: bool,
        error: Option<String>,
        started: Instant,
    ) -> RunResult {
        let mut summary = RunSummary::from_steps(goal, &run.steps);
        summary.stopped_before = run.stopped_before.clone();
        let result = RunResult {
            run_id: run.run_id.clone(),
            success,
            outcome,
            total_steps: run.steps.len(),
            processing_time_ms: started.elapsed().as_millis(),
            final_url: run.last_page.as_ref().map(|p| p.url.clone()),
            error,
            summary,
            steps: run.steps,
        };
        if let Err(e) = self.recorder.run_finished(&result.run_id, &result).await {
            warn!(run_id = %result.run_id, error = %e, "recorder failed");
        }
        info!(
            run_id = %result.run_id,
            ?outcome,
            success,
            steps = result.total_steps,
            success_rate = result.summary.success_rate,
            wall_ms = (run.ended_at_ms.unwrap_or(run.started_at_ms) - run.started_at_ms) as u64,
            failed = run.error.is_some(),
            "run finished"
        );
        result
    }
}

impl<C: Computer, O: Oracle> Agent<C, O, DryRunPolicy> {
    pub fn with_defaults(computer: C, oracle: O, cfg: AgentConfig) -> Self {
        Self::new(computer, oracle, DryRunPolicy::default(), cfg)
    }
}
