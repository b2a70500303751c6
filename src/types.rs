use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

// ========================= Goal =========================

/// The feature to demonstrate. Built once per run from the upstream document
/// extraction and never mutated by the agent.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Goal {
    pub feature_name: String,
    pub description: String,
    pub steps: Vec<String>,
    pub expected_outcomes: Vec<String>,
    pub prerequisites: Vec<String>,
    pub origin: String,
}

impl Goal {
    pub fn from_task(task: impl Into<String>, origin: impl Into<String>) -> Self {
        let description = task.into();
        Self {
            feature_name: description.lines().next().unwrap_or_default().trim().to_string(),
            description,
            origin: origin.into(),
            ..Default::default()
        }
    }

    pub fn with_feature_name(mut self, name: impl Into<String>) -> Self {
        self.feature_name = name.into();
        self
    }

    /// Merges extracted feature-usage instructions into the goal. Numbered or
    /// bulleted lines become documented steps when none were supplied.
    pub fn with_instructions(mut self, instructions: &str) -> Self {
        let instructions = instructions.trim();
        if instructions.is_empty() {
            return self;
        }
        self.description = format!(
            "{}\n\nFeature Usage Instructions:\n{}",
            self.description, instructions
        );
        if self.steps.is_empty() {
            self.steps = instructions
                .lines()
                .filter_map(strip_list_marker)
                .map(str::to_string)
                .collect();
        }
        self
    }

    /// Expected outcome for the step at `index`; the last documented outcome
    /// applies to any step past the end of the list.
    pub fn expected_for(&self, index: usize) -> Option<&str> {
        self.expected_outcomes
            .get(index)
            .or_else(|| self.expected_outcomes.last())
            .map(String::as_str)
    }
}

fn strip_list_marker(line: &str) -> Option<&str> {
    let line = line.trim();
    let rest = if let Some(rest) = line.strip_prefix(['-', '*', '•']) {
        rest
    } else {
        let digits = line.chars().take_while(char::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        line[digits..].strip_prefix(['.', ')'])?
    };
    let rest = rest.trim();
    (!rest.is_empty()).then_some(rest)
}

// ========================= Page state =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { width: 1280, height: 800 }
    }
}

/// One interactive element as reported by the automation surface.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PageElement {
    pub selector: String,
    pub text: String,
    /// aria-label, placeholder, name, title and similar attribute values.
    #[serde(default)]
    pub hints: Vec<String>,
}

impl PageElement {
    pub fn new(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Self { selector: selector.into(), text: text.into(), hints: Vec::new() }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }
}

/// Immutable snapshot of the live page. A newer capture supersedes it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub visible_text: Vec<String>,
    pub clickable: Vec<PageElement>,
    pub inputs: Vec<PageElement>,
    pub selectables: Vec<PageElement>,
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
    pub viewport: Viewport,
    pub captured_at_ms: u128,
}

impl PageState {
    /// Lowercased haystack of everything a user could read on the page.
    pub fn readable_text(&self) -> String {
        let mut s = String::with_capacity(256);
        s.push_str(&self.title);
        for t in &self.visible_text {
            s.push('\n');
            s.push_str(t);
        }
        for el in self.clickable.iter().chain(&self.inputs).chain(&self.selectables) {
            s.push('\n');
            s.push_str(&el.text);
        }
        s.to_lowercase()
    }

    /// Compact textual rendering used in oracle prompts.
    pub fn summary(&self, max_items: usize) -> String {
        let mut s = format!("URL: {}\nTitle: {}\n", self.url, self.title);
        s.push_str("Visible text:\n");
        for t in self.visible_text.iter().take(max_items) {
            s.push_str("- ");
            s.push_str(t);
            s.push('\n');
        }
        for (label, list) in [
            ("Clickable", &self.clickable),
            ("Inputs", &self.inputs),
            ("Selectables", &self.selectables),
        ] {
            if list.is_empty() {
                continue;
            }
            s.push_str(label);
            s.push_str(":\n");
            for el in list.iter().take(max_items) {
                s.push_str(&format!("- {} \"{}\"", el.selector, el.text));
                if !el.hints.is_empty() {
                    s.push_str(&format!(" ({})", el.hints.join(", ")));
                }
                s.push('\n');
            }
        }
        s
    }
}

// ========================= Actions =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Click,
    Type,
    Hover,
    Select,
    Wait,
    Scroll,
    Extract,
    Evaluate,
    ClickAt,
    TypeAt,
    HoverAt,
    SelectAt,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Navigate => "navigate",
            ActionKind::Click => "click",
            ActionKind::Type => "type",
            ActionKind::Hover => "hover",
            ActionKind::Select => "select",
            ActionKind::Wait => "wait",
            ActionKind::Scroll => "scroll",
            ActionKind::Extract => "extract",
            ActionKind::Evaluate => "evaluate",
            ActionKind::ClickAt => "click_at",
            ActionKind::TypeAt => "type_at",
            ActionKind::HoverAt => "hover_at",
            ActionKind::SelectAt => "select_at",
        }
    }

    /// Accepts the spellings oracles tend to produce.
    pub fn parse(raw: &str) -> Option<Self> {
        let k = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let kind = match k.as_str() {
            "navigate" | "goto" | "go_to" | "open" | "open_url" => ActionKind::Navigate,
            "click" | "tap" | "press" => ActionKind::Click,
            "type" | "fill" | "input" | "type_text" => ActionKind::Type,
            "hover" | "move" => ActionKind::Hover,
            "select" | "select_option" | "choose" => ActionKind::Select,
            "wait" | "wait_ms" | "sleep" => ActionKind::Wait,
            "scroll" => ActionKind::Scroll,
            "extract" | "read" => ActionKind::Extract,
            "evaluate" | "eval" | "script" => ActionKind::Evaluate,
            "click_at" | "click_coordinates" | "coordinate_click" => ActionKind::ClickAt,
            "type_at" | "type_coordinates" => ActionKind::TypeAt,
            "hover_at" | "hover_coordinates" => ActionKind::HoverAt,
            "select_at" | "select_coordinates" => ActionKind::SelectAt,
            _ => return None,
        };
        Some(kind)
    }

    /// Kinds that act on a specific element and therefore need a locator or coordinate.
    pub fn needs_target(&self) -> bool {
        matches!(
            self,
            ActionKind::Click
                | ActionKind::Type
                | ActionKind::Hover
                | ActionKind::Select
                | ActionKind::ClickAt
                | ActionKind::TypeAt
                | ActionKind::HoverAt
                | ActionKind::SelectAt
        )
    }

    pub fn is_coordinate(&self) -> bool {
        matches!(
            self,
            ActionKind::ClickAt | ActionKind::TypeAt | ActionKind::HoverAt | ActionKind::SelectAt
        )
    }

    /// Coordinate-addressed counterpart; non-interactive kinds map to themselves.
    pub fn at_variant(&self) -> Self {
        match self {
            ActionKind::Click => ActionKind::ClickAt,
            ActionKind::Type => ActionKind::TypeAt,
            ActionKind::Hover => ActionKind::HoverAt,
            ActionKind::Select => ActionKind::SelectAt,
            other => *other,
        }
    }

    /// Locator-addressed counterpart of a coordinate kind.
    pub fn base(&self) -> Self {
        match self {
            ActionKind::ClickAt => ActionKind::Click,
            ActionKind::TypeAt => ActionKind::Type,
            ActionKind::HoverAt => ActionKind::Hover,
            ActionKind::SelectAt => ActionKind::Select,
            other => *other,
        }
    }

    pub fn is_navigation(&self) -> bool {
        matches!(self, ActionKind::Navigate)
    }

    /// Kinds that observe or move the viewport without changing application state.
    pub fn is_passive(&self) -> bool {
        matches!(
            self.base(),
            ActionKind::Hover
                | ActionKind::Wait
                | ActionKind::Scroll
                | ActionKind::Extract
                | ActionKind::Evaluate
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel position inferred from a screenshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
    pub confidence: f64,
    pub reasoning: String,
}

impl Coordinate {
    pub fn clamp_to(mut self, viewport: Viewport) -> Self {
        self.x = self.x.clamp(0.0, viewport.width as f64);
        self.y = self.y.clamp(0.0, viewport.height as f64);
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    /// Concrete structural locator (CSS selector).
    #[serde(default)]
    pub locator: Option<String>,
    /// Human-readable description of the element to act on, resolved lazily.
    #[serde(default)]
    pub target: Option<String>,
    /// Text to type, URL to open, option to select, script to run or wait duration.
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub coordinate: Option<Coordinate>,
    pub description: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Action {
    pub fn new(kind: ActionKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            locator: None,
            target: None,
            value: None,
            coordinate: None,
            description: description.into(),
            metadata: Map::new(),
        }
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::new(ActionKind::Navigate, format!("Go to {url}")).with_value(url)
    }

    pub fn click(target: impl Into<String>) -> Self {
        let target = target.into();
        Self::new(ActionKind::Click, format!("Click {target}")).with_target(target)
    }

    pub fn type_into(target: impl Into<String>, text: impl Into<String>) -> Self {
        let target = target.into();
        Self::new(ActionKind::Type, format!("Type into {target}"))
            .with_target(target)
            .with_value(text)
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn annotate(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// True when the action targets an element but carries neither a locator nor a coordinate.
    pub fn needs_resolution(&self) -> bool {
        self.kind.needs_target() && self.locator.is_none() && self.coordinate.is_none()
    }

    /// What to hand the element resolver.
    pub fn target_description(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.description)
    }

    pub fn tooltip(&self) -> Option<String> {
        self.metadata
            .get("tooltip")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn expected_outcome(&self) -> Option<&str> {
        self.metadata.get("expected_outcome").and_then(Value::as_str)
    }

    /// Lowercased description, target and locator, used for keyword policies.
    pub fn keyword_text(&self) -> String {
        let mut s = self.description.to_lowercase();
        for part in [&self.target, &self.locator].into_iter().flatten() {
            s.push(' ');
            s.push_str(&part.to_lowercase());
        }
        s
    }
}

// ========================= Run records =========================

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScreenPosition {
    pub x: f64,
    pub y: f64,
}

/// Audit entry for one completed loop iteration. Appended, never mutated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    pub order: usize,
    pub action: Action,
    pub locator: Option<String>,
    pub coordinate: Option<Coordinate>,
    pub description: String,
    pub tooltip: Option<String>,
    pub position: Option<ScreenPosition>,
    pub url: Option<String>,
    pub captured_at_ms: u128,
    pub success: bool,
    pub error: Option<String>,
    /// Recoveries spent on this step before it settled.
    pub attempts: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    GoalReached,
    BudgetExhausted,
    DryRunStop,
    ZeroProgress,
    Cancelled,
    Failed,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub features_covered: Vec<String>,
    pub actions_performed: Vec<String>,
    pub action_counts: BTreeMap<String, usize>,
    pub success_rate: f64,
    pub stopped_before: Option<String>,
}

impl RunSummary {
    pub fn from_steps(goal: &Goal, steps: &[StepRecord]) -> Self {
        let mut action_counts = BTreeMap::new();
        for step in steps {
            *action_counts.entry(step.action.kind.to_string()).or_insert(0) += 1;
        }
        let successes: Vec<&StepRecord> = steps.iter().filter(|s| s.success).collect();
        let success_rate = if steps.is_empty() {
            0.0
        } else {
            successes.len() as f64 / steps.len() as f64
        };
        let features_covered = if successes.is_empty() || goal.feature_name.is_empty() {
            Vec::new()
        } else {
            vec![goal.feature_name.clone()]
        };
        Self {
            features_covered,
            actions_performed: successes.iter().map(|s| s.description.clone()).collect(),
            action_counts,
            success_rate,
            stopped_before: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub success: bool,
    pub outcome: RunOutcome,
    pub steps: Vec<StepRecord>,
    pub total_steps: usize,
    pub processing_time_ms: u128,
    pub final_url: Option<String>,
    pub error: Option<String>,
    pub summary: RunSummary,
}
