use crate::agent::Oracle;
use crate::credentials::{CredentialPool, KeyUsageRecord, PoolConfig};
use crate::parse::{self, Parsed};
use crate::types::{Action, Goal, PageState, StepRecord};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

// ========================= Replies =========================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Decision {
    /// `None` means the goal is reached or unreachable.
    pub action: Option<Action>,
    pub reasoning: String,
    pub confidence: f64,
    pub next_steps: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OracleVerdict {
    pub success: bool,
    pub reasoning: String,
    pub confidence: f64,
    /// Visual cues the oracle saw, e.g. confirmation toasts.
    pub success_indicators: Vec<String>,
    /// Error banners, spinners that never resolved and the like.
    pub failure_indicators: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Regeneration {
    pub action: Action,
    pub reasoning: String,
    pub recommendations: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VisualCandidate {
    pub x: f64,
    pub y: f64,
    pub confidence: f64,
    pub reasoning: String,
    pub element_type: String,
}

// ========================= Errors =========================

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("oracle returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed oracle envelope: {0}")]
    Malformed(String),
    #[error("oracle request timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, TransportError::RateLimited(_))
    }
}

#[derive(Debug, Error, Clone)]
pub enum OracleError {
    #[error("no oracle credentials configured")]
    NoCredentials,
    #[error("oracle call failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: TransportError },
}

// ========================= Transport =========================

#[derive(Clone, Debug)]
pub struct OracleRequest {
    pub system: String,
    pub prompt: String,
    pub image_png: Option<Vec<u8>>,
}

/// One round trip to the model service. Implementations report rate limiting
/// as [`TransportError::RateLimited`] so the client can rotate credentials.
#[async_trait]
pub trait OracleTransport: Send + Sync {
    async fn complete(&self, api_key: &str, request: &OracleRequest) -> Result<String, TransportError>;
}

/// OpenAI-compatible `chat/completions` transport.
pub struct HttpTransport {
    http: Client,
    api_base: String,
    model: String,
}

impl HttpTransport {
    pub fn new(cfg: &OracleConfig) -> Self {
        Self {
            http: Client::new(),
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
        }
    }
}

fn mentions_rate_limit(body: &str) -> bool {
    let b = body.to_ascii_lowercase();
    b.contains("rate limit") || b.contains("rate_limit") || b.contains("quota") || b.contains("resource_exhausted")
}

#[async_trait]
impl OracleTransport for HttpTransport {
    async fn complete(&self, api_key: &str, request: &OracleRequest) -> Result<String, TransportError> {
        let url = format!("{}/chat/completions", self.api_base);
        let mut content = vec![json!({ "type": "text", "text": request.prompt })];
        if let Some(png) = &request.image_png {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/png;base64,{}", STANDARD.encode(png)) }
            }));
        }
        let body = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": content }
            ]
        });

        let resp = self
            .http
            .post(url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        if status == StatusCode::TOO_MANY_REQUESTS || (!status.is_success() && mentions_rate_limit(&text)) {
            return Err(TransportError::RateLimited(format!("{status}")));
        }
        if !status.is_success() {
            return Err(TransportError::Http { status: status.as_u16(), body: text });
        }
        let v: Value = serde_json::from_str(&text).map_err(|e| TransportError::Malformed(e.to_string()))?;
        v.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TransportError::Malformed("response without message content".into()))
    }
}

// ========================= Prompts =========================

/// Prompt templates. `{name}` placeholders are substituted per call.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSet {
    pub system: String,
    pub decide: String,
    pub validate: String,
    pub regenerate: String,
    pub locate: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            system: "You operate a real web browser to demonstrate a product feature. \
                     Answer with exactly one JSON object and nothing else. \
                     Never save, submit, publish or delete anything."
                .into(),
            decide: r#"Goal:
{goal}

Progress: step {step_index} of at most {step_budget}.
Steps taken so far:
{history}

Current page:
{page}

Choose the single next action that advances the demonstration. Reply as
{"action": {"type": "navigate|click|type|hover|select|wait|scroll|extract|evaluate",
            "target": "<what the element looks like>", "locator": "<css selector if known>",
            "value": "<text, url, option or ms>", "description": "<what this step shows>",
            "tooltip": "<short caption for viewers>", "expected_outcome": "<what should change>"},
 "reasoning": "...", "confidence": 0.0-1.0, "next_steps": ["..."]}
Use "action": null once the feature has been fully demonstrated or cannot be reached."#
                .into(),
            validate: r#"An action was just performed.
Action: {action}
Expected outcome: {expected}

Page before:
{before}

Page after:
{after}

Did the action achieve the expected outcome? If a screenshot is attached, report
visual cues such as confirmation messages, error banners or endless spinners. Reply as
{"success": true|false, "reasoning": "...", "confidence": 0.0-1.0,
 "visual_indicators": {"success": ["..."], "failure": ["..."]}}"#
                .into(),
            regenerate: r#"Goal:
{goal}

Attempt {attempt} to recover from a failed action.
Failed action: {action}
Why it failed: {failure}

Current page:
{page}

Propose a different action that avoids the same mistake: another element,
direct navigation instead of a click, or a wait for the page to settle. Reply as
{"action": {...same fields as before...}, "reasoning": "...", "recommendations": ["..."]}"#
                .into(),
            locate: r#"The attached screenshot is {viewport} pixels.
Find: {target}

Reply with the most likely positions of that element's centre as
{"candidates": [{"x": 0, "y": 0, "confidence": 0.0-1.0, "reasoning": "...", "element_type": "button|link|input|select|other"}]}"#
                .into(),
        }
    }
}

impl PromptSet {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Fills `{name}` placeholders in one pass; substituted text is never rescanned.
fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        let value = tail.find('}').and_then(|close| {
            let name = &tail[..close];
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v, close))
        });
        match value {
            Some((v, close)) => {
                out.push_str(v);
                rest = &tail[close + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

fn describe_goal(goal: &Goal) -> String {
    let mut s = format!("Feature: {}\n{}\n", goal.feature_name, goal.description);
    for (label, items) in [
        ("Documented steps", &goal.steps),
        ("Expected outcomes", &goal.expected_outcomes),
        ("Prerequisites", &goal.prerequisites),
    ] {
        if items.is_empty() {
            continue;
        }
        s.push_str(label);
        s.push_str(":\n");
        for (i, item) in items.iter().enumerate() {
            s.push_str(&format!("{}. {}\n", i + 1, item));
        }
    }
    s.push_str(&format!("Site: {}", goal.origin));
    s
}

fn describe_history(steps: &[StepRecord]) -> String {
    if steps.is_empty() {
        return "(none)".into();
    }
    steps
        .iter()
        .map(|s| {
            let status = if s.success { "ok" } else { "failed" };
            let target = s.locator.as_deref().unwrap_or("-");
            format!("{}. [{}] {} {} ({})", s.order, status, s.action.kind, s.description, target)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_action(action: &Action) -> String {
    serde_json::to_string(action).unwrap_or_else(|_| action.description.clone())
}

// ========================= Client =========================

#[derive(Clone)]
pub struct OracleConfig {
    pub api_base: String,     // e.g. "https://api.openai.com/v1"
    pub api_keys: Vec<String>, // env ORACLE_API_KEYS, comma separated
    pub model: String,
    pub request_timeout: Duration,
    /// Attempts per call across credentials before the last error is surfaced.
    pub max_attempts: u32,
    /// Items of each page list included in prompts.
    pub page_items: usize,
    pub pool: PoolConfig,
    pub prompts: PromptSet,
}

impl Default for OracleConfig {
    fn default() -> Self {
        let api_keys = env::var("ORACLE_API_KEYS")
            .or_else(|_| env::var("OPENAI_API_KEY"))
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        let prompts = match env::var("ORACLE_PROMPTS") {
            Ok(path) => PromptSet::load(&path).unwrap_or_else(|e| {
                warn!(path = %path, error = %e, "failed to load prompt set, using built-in prompts");
                PromptSet::default()
            }),
            Err(_) => PromptSet::default(),
        };
        Self {
            api_base: env::var("ORACLE_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_keys,
            model: env::var("ORACLE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            request_timeout: Duration::from_secs(30),
            max_attempts: 3,
            page_items: 40,
            pool: PoolConfig::default(),
            prompts,
        }
    }
}

/// Decision oracle client. Every call is routed through a shared credential
/// pool; clones share the pool.
#[derive(Clone)]
pub struct OracleClient {
    transport: Arc<dyn OracleTransport>,
    pool: Arc<Mutex<CredentialPool>>,
    cfg: OracleConfig,
}

impl OracleClient {
    pub fn new(cfg: OracleConfig) -> Result<Self, OracleError> {
        let transport = Arc::new(HttpTransport::new(&cfg));
        Self::with_transport(cfg, transport)
    }

    pub fn with_transport(cfg: OracleConfig, transport: Arc<dyn OracleTransport>) -> Result<Self, OracleError> {
        if cfg.api_keys.is_empty() {
            return Err(OracleError::NoCredentials);
        }
        let pool = CredentialPool::new(cfg.api_keys.clone(), cfg.pool.clone());
        Ok(Self { transport, pool: Arc::new(Mutex::new(pool)), cfg })
    }

    pub async fn usage(&self) -> Vec<KeyUsageRecord> {
        self.pool.lock().await.usage().to_vec()
    }

    /// Sends one request, rotating credentials on failure. Rate-limited
    /// credentials are penalised before the next attempt.
    pub async fn call(&self, purpose: &str, request: &OracleRequest) -> Result<String, OracleError> {
        let mut last = TransportError::Network("no attempt made".into());
        for attempt in 1..=self.cfg.max_attempts {
            let lease = self
                .pool
                .lock()
                .await
                .acquire(Instant::now())
                .ok_or(OracleError::NoCredentials)?;
            debug!(purpose, attempt, credential = lease.index, "oracle request");

            let outcome = match timeout(self.cfg.request_timeout, self.transport.complete(&lease.key, request)).await {
                Ok(r) => r,
                Err(_) => Err(TransportError::Timeout(self.cfg.request_timeout)),
            };
            match outcome {
                Ok(text) => return Ok(text),
                Err(e) => {
                    if e.is_rate_limit() {
                        self.pool.lock().await.penalize(lease.index, Instant::now());
                    }
                    warn!(purpose, attempt, credential = lease.index, error = %e, "oracle request failed");
                    last = e;
                }
            }
        }
        Err(OracleError::Exhausted { attempts: self.cfg.max_attempts, last })
    }

    fn request(&self, prompt: String, image: Option<&[u8]>) -> OracleRequest {
        OracleRequest {
            system: self.cfg.prompts.system.clone(),
            prompt,
            image_png: image.map(<[u8]>::to_vec),
        }
    }
}

fn log_unparseable<T>(purpose: &str, raw: &str, parsed: &Parsed<T>) {
    if let Err(e) = parsed {
        let snippet: String = raw.chars().take(200).collect();
        warn!(purpose, error = %e, response = %snippet, "unparseable oracle response");
    }
}

#[async_trait]
impl Oracle for OracleClient {
    async fn decide_next_action(
        &self,
        page: &PageState,
        goal: &Goal,
        history: &[StepRecord],
        step_budget: usize,
        step_index: usize,
    ) -> Result<Parsed<Decision>, OracleError> {
        let goal_text = describe_goal(goal);
        let index = (step_index + 1).to_string();
        let budget = step_budget.to_string();
        let history = describe_history(history);
        let summary = page.summary(self.cfg.page_items);
        let prompt = render(
            &self.cfg.prompts.decide,
            &[
                ("goal", goal_text.as_str()),
                ("step_index", index.as_str()),
                ("step_budget", budget.as_str()),
                ("history", history.as_str()),
                ("page", summary.as_str()),
            ],
        );
        let raw = self.call("decide", &self.request(prompt, page.screenshot.as_deref())).await?;
        let parsed = parse::parse_decision(&raw);
        log_unparseable("decide", &raw, &parsed);
        Ok(parsed)
    }

    async fn validate(
        &self,
        action: &Action,
        expected: &str,
        before: &PageState,
        after: &PageState,
        evidence: Option<&[u8]>,
    ) -> Result<Parsed<OracleVerdict>, OracleError> {
        let action_text = describe_action(action);
        let before_text = before.summary(self.cfg.page_items);
        let after_text = after.summary(self.cfg.page_items);
        let prompt = render(
            &self.cfg.prompts.validate,
            &[
                ("action", action_text.as_str()),
                ("expected", expected),
                ("before", before_text.as_str()),
                ("after", after_text.as_str()),
            ],
        );
        let raw = self.call("validate", &self.request(prompt, evidence)).await?;
        let parsed = parse::parse_verdict(&raw);
        log_unparseable("validate", &raw, &parsed);
        Ok(parsed)
    }

    async fn regenerate_action(
        &self,
        failed: &Action,
        failure_reasoning: &str,
        page: &PageState,
        goal: &Goal,
        attempt: u32,
    ) -> Result<Parsed<Regeneration>, OracleError> {
        let goal_text = describe_goal(goal);
        let attempt_text = attempt.to_string();
        let action_text = describe_action(failed);
        let summary = page.summary(self.cfg.page_items);
        let prompt = render(
            &self.cfg.prompts.regenerate,
            &[
                ("goal", goal_text.as_str()),
                ("attempt", attempt_text.as_str()),
                ("action", action_text.as_str()),
                ("failure", failure_reasoning),
                ("page", summary.as_str()),
            ],
        );
        let raw = self.call("regenerate", &self.request(prompt, page.screenshot.as_deref())).await?;
        let parsed = parse::parse_regeneration(&raw);
        log_unparseable("regenerate", &raw, &parsed);
        Ok(parsed)
    }

    async fn locate_visually(
        &self,
        target: &str,
        page: &PageState,
        screenshot: &[u8],
    ) -> Result<Parsed<Vec<VisualCandidate>>, OracleError> {
        let viewport = format!("{}x{}", page.viewport.width, page.viewport.height);
        let prompt = render(&self.cfg.prompts.locate, &[("viewport", viewport.as_str()), ("target", target)]);
        let raw = self.call("locate", &self.request(prompt, Some(screenshot))).await?;
        let parsed = parse::parse_visual_candidates(&raw);
        log_unparseable("locate", &raw, &parsed);
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::ParseError;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Replays canned replies and records which key served each request.
    struct ScriptedTransport {
        replies: StdMutex<VecDeque<Result<String, TransportError>>>,
        keys_seen: StdMutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<String, TransportError>>) -> Arc<Self> {
            Arc::new(Self { replies: StdMutex::new(replies.into()), keys_seen: StdMutex::new(Vec::new()) })
        }

        fn keys_seen(&self) -> Vec<String> {
            self.keys_seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OracleTransport for ScriptedTransport {
        async fn complete(&self, api_key: &str, _request: &OracleRequest) -> Result<String, TransportError> {
            self.keys_seen.lock().unwrap().push(api_key.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Network("script exhausted".into())))
        }
    }

    fn config(keys: &[&str]) -> OracleConfig {
        OracleConfig {
            api_base: "http://oracle.invalid".into(),
            api_keys: keys.iter().map(|k| k.to_string()).collect(),
            model: "test".into(),
            request_timeout: Duration::from_secs(5),
            max_attempts: 3,
            page_items: 10,
            pool: PoolConfig { cooldown: Duration::ZERO, ..Default::default() },
            prompts: PromptSet::default(),
        }
    }

    fn page() -> PageState {
        PageState { url: "https://app.test/".into(), title: "Home".into(), ..Default::default() }
    }

    #[test]
    fn client_requires_credentials() {
        let t = ScriptedTransport::new(vec![]);
        assert!(matches!(OracleClient::with_transport(config(&[]), t), Err(OracleError::NoCredentials)));
    }

    #[tokio::test]
    async fn rate_limit_rotates_and_penalizes() {
        let t = ScriptedTransport::new(vec![
            Err(TransportError::RateLimited("429".into())),
            Ok(r#"{"action": null, "reasoning": "all shown"}"#.into()),
        ]);
        let client = OracleClient::with_transport(config(&["a", "b", "c"]), t.clone()).unwrap();
        let decision = client
            .decide_next_action(&page(), &Goal::default(), &[], 5, 0)
            .await
            .unwrap()
            .unwrap();
        assert!(decision.action.is_none());
        assert_eq!(t.keys_seen(), vec!["a", "b"]);
        let usage = client.usage().await;
        assert!(usage[0].penalty_until.is_some());
        assert!(usage[1].penalty_until.is_none());
    }

    #[tokio::test]
    async fn gives_up_after_retry_ceiling() {
        let t = ScriptedTransport::new(vec![
            Err(TransportError::Http { status: 500, body: "boom".into() }),
            Err(TransportError::Network("reset".into())),
            Err(TransportError::Http { status: 502, body: "bad gateway".into() }),
            Ok("{\"action\": null}".into()),
        ]);
        let client = OracleClient::with_transport(config(&["a", "b"]), t.clone()).unwrap();
        let err = client.call("decide", &client.request("hi".into(), None)).await.unwrap_err();
        match err {
            OracleError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(last, TransportError::Http { status: 502, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(t.keys_seen(), vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn unparseable_reply_is_a_value_not_an_error() {
        let t = ScriptedTransport::new(vec![Ok("I think it worked!".into())]);
        let client = OracleClient::with_transport(config(&["a"]), t).unwrap();
        let verdict = client.validate(&Action::click("Export"), "menu opens", &page(), &page(), None).await;
        assert!(matches!(verdict, Ok(Err(ParseError::NoJson))));
    }

    #[test]
    fn prompts_render_placeholders() {
        let out = render("{a} and {b} and {a}", &[("a", "x"), ("b", "y")]);
        assert_eq!(out, "x and y and x");
        let out = render("Goal: {goal}\nPage: {page}", &[("goal", "use {page} literally"), ("page", "URL: x")]);
        assert_eq!(out, "Goal: use {page} literally\nPage: URL: x");
        assert_eq!(render("{unknown} {", &[("a", "x")]), "{unknown} {");
        let goal = Goal {
            feature_name: "Export".into(),
            steps: vec!["Open reports".into()],
            origin: "https://app.test".into(),
            ..Default::default()
        };
        let text = describe_goal(&goal);
        assert!(text.contains("1. Open reports"));
        assert!(text.ends_with("Site: https://app.test"));
    }

    #[test]
    fn rate_limit_bodies_are_recognised() {
        assert!(mentions_rate_limit("{\"error\": \"Rate limit reached\"}"));
        assert!(mentions_rate_limit("RESOURCE_EXHAUSTED: quota"));
        assert!(!mentions_rate_limit("invalid api key"));
    }
}
