//! Tolerant decoding of oracle replies.
//!
//! Oracles wrap their JSON in prose or markdown fences and omit fields freely.
//! Everything here extracts the first balanced JSON value it can parse and then
//! reads each field with an explicit default, so callers only ever see fully
//! populated values or a [`ParseError`].

use crate::oracle::{Decision, OracleVerdict, Regeneration, VisualCandidate};
use crate::types::{Action, ActionKind, Coordinate};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("no JSON value found in oracle response")]
    NoJson,
    #[error("invalid JSON in oracle response: {0}")]
    InvalidJson(String),
    #[error("unexpected response shape: {0}")]
    Shape(String),
}

/// Strict result of decoding one oracle reply.
pub type Parsed<T> = Result<T, ParseError>;

/// Returns the first balanced `{...}` or `[...]` in `raw` that parses as JSON.
pub fn extract_json(raw: &str) -> Parsed<Value> {
    let mut last_err = None;
    for (start, ch) in raw.char_indices() {
        if ch != '{' && ch != '[' {
            continue;
        }
        let Some(end) = balanced_end(&raw[start..]) else {
            continue;
        };
        match serde_json::from_str::<Value>(&raw[start..start + end]) {
            Ok(v) => return Ok(v),
            Err(e) => last_err = Some(e.to_string()),
        }
    }
    Err(last_err.map(ParseError::InvalidJson).unwrap_or(ParseError::NoJson))
}

/// Byte length of the bracketed value starting at the beginning of `s`,
/// skipping brackets inside string literals.
fn balanced_end(s: &str) -> Option<usize> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in s.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(idx + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

// ========================= Field readers =========================

fn object(v: &Value) -> Parsed<&Map<String, Value>> {
    v.as_object()
        .ok_or_else(|| ParseError::Shape(format!("expected an object, got {}", kind_of(v))))
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn first<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k)).filter(|v| !v.is_null())
}

fn opt_string(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match first(obj, keys)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_or(obj: &Map<String, Value>, keys: &[&str], sentinel: &str) -> String {
    opt_string(obj, keys).unwrap_or_else(|| sentinel.to_string())
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|n: &f64| n.is_finite())
}

fn confidence(obj: &Map<String, Value>, keys: &[&str]) -> f64 {
    first(obj, keys)
        .and_then(number)
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(DEFAULT_CONFIDENCE)
}

fn string_list(obj: &Map<String, Value>, keys: &[&str]) -> Vec<String> {
    match first(obj, keys) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| match i {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn boolean(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "success" | "passed" => Some(true),
            "false" | "no" | "failure" | "failed" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

// ========================= Actions =========================

/// Decodes one action object. The kind may sit under `type`, `kind` or `action`.
pub fn parse_action(v: &Value) -> Parsed<Action> {
    let obj = object(v)?;
    let raw_kind = opt_string(obj, &["type", "kind", "action", "action_type"])
        .ok_or_else(|| ParseError::Shape("action without a type".into()))?;
    let mut kind = ActionKind::parse(&raw_kind)
        .ok_or_else(|| ParseError::Shape(format!("unknown action type `{raw_kind}`")))?;

    let description = string_or(obj, &["description", "summary"], "no description provided");
    let mut action = Action::new(kind, description);
    action.locator = opt_string(obj, &["locator", "selector", "css"]);
    action.target = opt_string(obj, &["target", "element", "target_description"]);
    action.value = opt_string(obj, &["value", "text", "url", "option", "script", "ms"]);

    let x = first(obj, &["x"]).and_then(number);
    let y = first(obj, &["y"]).and_then(number);
    if let (Some(x), Some(y)) = (x, y) {
        if kind.needs_target() {
            kind = kind.at_variant();
        }
        action.coordinate = Some(Coordinate {
            x,
            y,
            confidence: confidence(obj, &["coordinate_confidence", "confidence"]),
            reasoning: string_or(obj, &["coordinate_reasoning", "reasoning"], "no reasoning provided"),
        });
    } else if kind.is_coordinate() {
        return Err(ParseError::Shape(format!("{kind} without x/y")));
    }
    action.kind = kind;

    if kind.is_navigation() && action.value.is_none() {
        return Err(ParseError::Shape("navigate without a url".into()));
    }

    if let Some(Value::Object(extra)) = obj.get("metadata") {
        action.metadata = extra.clone();
    }
    for key in ["tooltip", "expected_outcome"] {
        if let Some(s) = opt_string(obj, &[key]) {
            action.metadata.insert(key.to_string(), Value::String(s));
        }
    }
    Ok(action)
}

/// `action` may be an object, `null`, or a bare kind string with the other
/// fields at the top level.
fn action_field(obj: &Map<String, Value>) -> Parsed<Option<Action>> {
    let done = first(obj, &["done", "goal_achieved", "complete"])
        .and_then(boolean)
        .unwrap_or(false);
    match obj.get("action") {
        Some(Value::Null) => Ok(None),
        Some(v @ Value::Object(_)) => parse_action(v).map(Some),
        Some(Value::String(s)) if matches!(s.trim().to_ascii_lowercase().as_str(), "done" | "none" | "finish") => {
            Ok(None)
        }
        Some(Value::String(_)) => parse_action(&Value::Object(obj.clone())).map(Some),
        Some(other) => Err(ParseError::Shape(format!("action is a {}", kind_of(other)))),
        None if done => Ok(None),
        None => Err(ParseError::Shape("missing action field".into())),
    }
}

// ========================= Replies =========================

pub fn parse_decision(raw: &str) -> Parsed<Decision> {
    let v = extract_json(raw)?;
    let obj = object(&v)?;
    Ok(Decision {
        action: action_field(obj)?,
        reasoning: string_or(obj, &["reasoning", "rationale", "thought"], "no reasoning provided"),
        confidence: confidence(obj, &["confidence"]),
        next_steps: string_list(obj, &["next_steps", "nextSteps", "plan"]),
    })
}

pub fn parse_verdict(raw: &str) -> Parsed<OracleVerdict> {
    let v = extract_json(raw)?;
    let obj = object(&v)?;
    let success = first(obj, &["success", "passed", "valid"])
        .and_then(boolean)
        .ok_or_else(|| ParseError::Shape("verdict without a success flag".into()))?;
    let (mut success_indicators, mut failure_indicators) = match obj.get("visual_indicators") {
        Some(Value::Object(vis)) => (
            string_list(vis, &["success", "positive"]),
            string_list(vis, &["failure", "negative"]),
        ),
        _ => (Vec::new(), Vec::new()),
    };
    success_indicators.extend(string_list(obj, &["success_indicators"]));
    failure_indicators.extend(string_list(obj, &["failure_indicators"]));
    Ok(OracleVerdict {
        success,
        reasoning: string_or(obj, &["reasoning", "explanation"], "no reasoning provided"),
        confidence: confidence(obj, &["confidence"]),
        success_indicators,
        failure_indicators,
    })
}

pub fn parse_regeneration(raw: &str) -> Parsed<Regeneration> {
    let v = extract_json(raw)?;
    let obj = object(&v)?;
    let action = action_field(obj)?
        .ok_or_else(|| ParseError::Shape("regeneration without an action".into()))?;
    Ok(Regeneration {
        action,
        reasoning: string_or(obj, &["reasoning", "analysis"], "no reasoning provided"),
        recommendations: string_list(obj, &["recommendations", "suggestions"]),
    })
}

pub fn parse_visual_candidates(raw: &str) -> Parsed<Vec<VisualCandidate>> {
    let v = extract_json(raw)?;
    let items: Vec<&Value> = match &v {
        Value::Array(items) => items.iter().collect(),
        Value::Object(obj) => match obj.get("candidates").or_else(|| obj.get("elements")) {
            Some(Value::Array(items)) => items.iter().collect(),
            _ if obj.contains_key("x") => vec![&v],
            _ => Vec::new(),
        },
        other => return Err(ParseError::Shape(format!("candidates are a {}", kind_of(other)))),
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(obj) = item.as_object() else { continue };
        let (Some(x), Some(y)) = (
            first(obj, &["x"]).and_then(number),
            first(obj, &["y"]).and_then(number),
        ) else {
            continue;
        };
        out.push(VisualCandidate {
            x,
            y,
            confidence: confidence(obj, &["confidence"]),
            reasoning: string_or(obj, &["reasoning", "why"], "no reasoning provided"),
            element_type: string_or(obj, &["element_type", "type"], "unknown"),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_fenced_block() {
        let raw = "Sure! Here you go:\n```json\n{\"action\": null, \"reasoning\": \"done\"}\n```\nLet me know.";
        let v = extract_json(raw).unwrap();
        assert_eq!(v["reasoning"], "done");
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_extraction() {
        let raw = r#"prefix {"reasoning": "use the {id} } selector", "nested": {"a": [1, 2]}} trailing }"#;
        let v = extract_json(raw).unwrap();
        assert_eq!(v["nested"]["a"][1], 2);
        assert_eq!(v["reasoning"], "use the {id} } selector");
    }

    #[test]
    fn skips_unparseable_bracket_runs() {
        let raw = "Step {one} then {\"success\": true}";
        let v = extract_json(raw).unwrap();
        assert_eq!(v["success"], true);
    }

    #[test]
    fn missing_json_is_an_error() {
        assert_eq!(extract_json("nothing here"), Err(ParseError::NoJson));
        assert!(matches!(extract_json("{\"a\": }"), Err(ParseError::InvalidJson(_))));
    }

    #[test]
    fn null_action_is_completion_with_defaults() {
        let d = parse_decision("{\"action\": null}").unwrap();
        assert!(d.action.is_none());
        assert_eq!(d.confidence, DEFAULT_CONFIDENCE);
        assert_eq!(d.reasoning, "no reasoning provided");
        assert!(d.next_steps.is_empty());
    }

    #[test]
    fn decision_with_coordinates_becomes_coordinate_kind() {
        let raw = r#"{"action": {"type": "click", "x": 120, "y": "44", "description": "Open menu", "tooltip": "Menu lives here"}, "confidence": 1.7, "next_steps": ["pick csv"]}"#;
        let d = parse_decision(raw).unwrap();
        let a = d.action.unwrap();
        assert_eq!(a.kind, ActionKind::ClickAt);
        let c = a.coordinate.clone().unwrap();
        assert_eq!((c.x, c.y), (120.0, 44.0));
        assert_eq!(a.tooltip().as_deref(), Some("Menu lives here"));
        assert_eq!(d.confidence, 1.0);
        assert_eq!(d.next_steps, vec!["pick csv"]);
    }

    #[test]
    fn non_finite_coordinates_are_ignored() {
        let raw = r#"{"action": {"type": "click", "x": "NaN", "y": 44, "target": "Export"}}"#;
        let a = parse_decision(raw).unwrap().action.unwrap();
        assert_eq!(a.kind, ActionKind::Click);
        assert!(a.coordinate.is_none());
        assert!(matches!(
            parse_decision(r#"{"action": {"type": "click_at", "x": "inf", "y": 44}}"#),
            Err(ParseError::Shape(_))
        ));
    }

    #[test]
    fn flat_action_shape_is_accepted() {
        let d = parse_decision(r##"{"action": "type", "selector": "#q", "text": "reports"}"##).unwrap();
        let a = d.action.unwrap();
        assert_eq!(a.kind, ActionKind::Type);
        assert_eq!(a.locator.as_deref(), Some("#q"));
        assert_eq!(a.value.as_deref(), Some("reports"));
        assert_eq!(a.description, "no description provided");
    }

    #[test]
    fn bad_actions_are_shape_errors() {
        assert!(matches!(parse_decision(r#"{"reasoning": "hm"}"#), Err(ParseError::Shape(_))));
        assert!(matches!(
            parse_decision(r#"{"action": {"type": "teleport"}}"#),
            Err(ParseError::Shape(_))
        ));
        assert!(matches!(
            parse_decision(r#"{"action": {"type": "navigate"}}"#),
            Err(ParseError::Shape(_))
        ));
        assert!(parse_decision(r#"{"done": true}"#).unwrap().action.is_none());
    }

    #[test]
    fn verdict_reads_visual_indicators() {
        let raw = r#"Verdict: {"success": "false", "reasoning": "error toast", "visual_indicators": {"failure": ["red banner"]}}"#;
        let v = parse_verdict(raw).unwrap();
        assert!(!v.success);
        assert_eq!(v.failure_indicators, vec!["red banner"]);
        assert!(v.success_indicators.is_empty());
        assert!(matches!(parse_verdict(r#"{"reasoning": "?"}"#), Err(ParseError::Shape(_))));
    }

    #[test]
    fn regeneration_requires_an_action() {
        let r = parse_regeneration(
            r#"{"action": {"type": "navigate", "url": "https://x.test/export"}, "recommendations": ["skip the menu"]}"#,
        )
        .unwrap();
        assert_eq!(r.action.kind, ActionKind::Navigate);
        assert_eq!(r.recommendations, vec!["skip the menu"]);
        assert!(parse_regeneration(r#"{"action": null}"#).is_err());
    }

    #[test]
    fn visual_candidates_accept_several_shapes() {
        let list = parse_visual_candidates(r#"[{"x": 1, "y": 2}, {"x": "bad"}]"#).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].element_type, "unknown");
        let wrapped =
            parse_visual_candidates(r#"{"candidates": [{"x": 5, "y": 6, "confidence": 0.9}]}"#).unwrap();
        assert_eq!(wrapped[0].confidence, 0.9);
        let single = parse_visual_candidates(r#"{"x": 7, "y": 8}"#).unwrap();
        assert_eq!(single[0].x, 7.0);
    }
}
