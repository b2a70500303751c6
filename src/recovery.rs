use crate::agent::Oracle;
use crate::policy::Criticality;
use crate::types::{Action, Goal, PageState};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub enum RecoveryPlan {
    /// Try this action next. `degraded` marks a blind re-issue of the failed action.
    Retry {
        action: Action,
        reasoning: String,
        recommendations: Vec<String>,
        degraded: bool,
    },
    /// Give up on the run.
    Abort { reason: String },
}

/// Feeds validation failures back to the oracle for an improved action.
#[derive(Clone, Debug)]
pub struct RecoveryPlanner {
    pub max_retries: u32,
    pub criticality: Criticality,
}

impl Default for RecoveryPlanner {
    fn default() -> Self {
        Self { max_retries: 3, criticality: Criticality::default() }
    }
}

impl RecoveryPlanner {
    pub fn new(max_retries: u32, criticality: Criticality) -> Self {
        Self { max_retries, criticality }
    }

    pub fn is_critical(&self, action: &Action) -> bool {
        self.criticality.is_critical(action)
    }

    /// `attempt` counts from 1 up to `max_retries`.
    pub async fn plan<O: Oracle + ?Sized>(
        &self,
        oracle: &O,
        failed: &Action,
        failure_reasoning: &str,
        page: &PageState,
        goal: &Goal,
        attempt: u32,
    ) -> RecoveryPlan {
        if attempt == 0 || attempt > self.max_retries {
            return RecoveryPlan::Abort {
                reason: format!("retry budget of {} exhausted for \"{}\"", self.max_retries, failed.description),
            };
        }
        match oracle
            .regenerate_action(failed, failure_reasoning, page, goal, attempt)
            .await
        {
            Ok(Ok(regen)) => {
                let mut action = regen.action;
                action.annotate("retry_attempt", attempt);
                info!(attempt, kind = %action.kind, description = %action.description, "regenerated action");
                RecoveryPlan::Retry {
                    action,
                    reasoning: regen.reasoning,
                    recommendations: regen.recommendations,
                    degraded: false,
                }
            }
            Ok(Err(e)) => self.fallback(failed, failure_reasoning, attempt, &e.to_string()),
            Err(e) => self.fallback(failed, failure_reasoning, attempt, &e.to_string()),
        }
    }

    /// Plan used when the oracle could not propose anything: critical actions
    /// abort, anything else is re-issued as it was.
    pub fn fallback(&self, failed: &Action, failure_reasoning: &str, attempt: u32, oracle_error: &str) -> RecoveryPlan {
        if self.is_critical(failed) {
            warn!(attempt, error = oracle_error, "recovery unavailable for critical action");
            return RecoveryPlan::Abort {
                reason: format!(
                    "could not recover critical action \"{}\": {failure_reasoning} (recovery oracle: {oracle_error})",
                    failed.description
                ),
            };
        }
        warn!(attempt, error = oracle_error, "recovery oracle failed, re-issuing original action");
        let mut action = failed.clone();
        action.annotate("retry_attempt", attempt);
        action.annotate("failure_reason", Value::String(failure_reasoning.to_string()));
        RecoveryPlan::Retry {
            action,
            reasoning: format!("re-issuing after recovery failure: {oracle_error}"),
            recommendations: Vec::new(),
            degraded: true,
        }
    }
}
