use serde::{Deserialize, Serialize};
use tracing::warn;

/// Opaque identifier for a browser tab. The CDP driver maps it to a
/// DevTools `targetId` at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u32);

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tab:{}", self.0)
    }
}

/// How `click_element` should approach the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClickMethod {
    /// Coordinate click first, then JS, then focus+Enter.
    #[default]
    Auto,
    /// Skip straight to `element.click()`.
    Js,
    /// Skip straight to focus + Enter.
    Focus,
}

impl ClickMethod {
    pub fn from_str(s: &str) -> Self {
        match s {
            "js" => Self::Js,
            "focus" => Self::Focus,
            _ => Self::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

/// A policy-issued step. Kinds are an open string set; anything the
/// executor does not recognize degrades to `wait` at normalization time.
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<ScrollDirection>,
    #[serde(rename = "clickMethod", skip_serializing_if = "is_auto")]
    pub click_method: ClickMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
}

fn is_auto(m: &ClickMethod) -> bool {
    *m == ClickMethod::Auto
}

/// Kinds the executor knows how to run.
pub const KNOWN_ACTION_KINDS: &[&str] = &[
    "click",
    "type",
    "input",
    "search",
    "press",
    "submit",
    "enter",
    "scroll",
    "navigate",
    "wait",
    "screenshot",
    "done",
    "clear_input",
];

impl Action {
    pub fn wait() -> Self {
        Self {
            kind: "wait".to_string(),
            selector: None,
            text: None,
            url: None,
            direction: None,
            click_method: ClickMethod::Auto,
            thought: None,
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            kind: "done".to_string(),
            done: true,
            ..Self::wait()
        }
    }

    /// Whether this action ends the session.
    pub fn is_done(&self) -> bool {
        self.done || self.kind == "done"
    }

    /// Parse an action from wire JSON, resolving the field aliases the
    /// policy server uses interchangeably: `value`/`key`/`query` all fill
    /// the text slot, `element` fills the selector slot. Unknown kinds
    /// degrade to `wait`.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let get_str =
            |key: &str| -> Option<String> { value.get(key).and_then(|v| v.as_str()).map(String::from) };

        let mut kind = get_str("action")
            .or_else(|| get_str("kind"))
            .unwrap_or_else(|| "wait".to_string())
            .to_lowercase();
        if !KNOWN_ACTION_KINDS.contains(&kind.as_str()) {
            warn!(kind = %kind, "Unknown action kind from policy, degrading to wait");
            kind = "wait".to_string();
        }

        let selector = get_str("selector").or_else(|| get_str("element"));
        let text = get_str("text")
            .or_else(|| get_str("value"))
            .or_else(|| get_str("key"))
            .or_else(|| get_str("query"));
        let direction = match get_str("direction").as_deref() {
            Some("up") => Some(ScrollDirection::Up),
            Some("down") => Some(ScrollDirection::Down),
            _ => None,
        };
        let click_method = get_str("clickMethod")
            .map(|m| ClickMethod::from_str(&m))
            .unwrap_or_default();
        let done = value.get("done").and_then(|v| v.as_bool()).unwrap_or(false);

        Self {
            kind,
            selector,
            text,
            url: get_str("url"),
            direction,
            click_method,
            thought: get_str("thought"),
            done,
        }
    }
}

/// One entry of the session action log, appended after every execution
/// attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub kind: String,
    #[serde(default)]
    pub selector: String,
    pub success: bool,
    pub url_after: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub step: u32,
}

/// Type hint the element enumerator assigns to each candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ElementKind {
    Link,
    Button,
    Input,
    Select,
    Element,
}

impl ElementKind {
    pub fn from_tag(tag: &str, role: Option<&str>) -> Self {
        match role {
            Some("button") => return Self::Button,
            Some("link") => return Self::Link,
            Some("textbox") => return Self::Input,
            _ => {}
        }
        match tag {
            "a" => Self::Link,
            "button" => Self::Button,
            "input" | "textarea" => Self::Input,
            "select" => Self::Select,
            _ => Self::Element,
        }
    }
}

/// One interactive element as shipped to the policy. The index is 1-based
/// and stable within a single observation only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractiveElement {
    pub index: u32,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    pub selector: String,
    pub tag: String,
    pub text: String,
}

/// Snapshot of a tab at one step, shipped to the policy before each
/// action request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub task: String,
    pub url: String,
    pub title: String,
    /// Base64 JPEG, captured at quality 30 for the agent loop.
    pub screenshot: String,
    pub elements: Vec<InteractiveElement>,
    #[serde(default)]
    pub console_logs: Vec<String>,
    #[serde(default)]
    pub action_history: Vec<ActionRecord>,
    #[serde(default)]
    pub progress_notes: String,
    pub original_goal: String,
    #[serde(default)]
    pub last_action_error: String,
}

/// Bridge connection lifecycle. Progresses monotonically during one
/// attempt; may cycle arbitrarily across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_text_aliases() {
        for alias in ["text", "value", "key", "query"] {
            let action = Action::from_value(&json!({"action": "type", alias: "hello"}));
            assert_eq!(action.text.as_deref(), Some("hello"), "alias {}", alias);
        }
    }

    #[test]
    fn test_action_element_alias() {
        let action = Action::from_value(&json!({"action": "click", "element": "#go"}));
        assert_eq!(action.selector.as_deref(), Some("#go"));
    }

    #[test]
    fn test_unknown_kind_degrades_to_wait() {
        let action = Action::from_value(&json!({"action": "teleport", "url": "https://x.test"}));
        assert_eq!(action.kind, "wait");
    }

    #[test]
    fn test_done_flag_and_kind() {
        assert!(Action::from_value(&json!({"action": "done"})).is_done());
        assert!(Action::from_value(&json!({"action": "wait", "done": true})).is_done());
        assert!(!Action::from_value(&json!({"action": "click"})).is_done());
    }

    #[test]
    fn test_click_method_hint() {
        let action = Action::from_value(&json!({"action": "click", "clickMethod": "js"}));
        assert_eq!(action.click_method, ClickMethod::Js);
        let action = Action::from_value(&json!({"action": "click"}));
        assert_eq!(action.click_method, ClickMethod::Auto);
    }

    #[test]
    fn test_element_kind_from_tag() {
        assert_eq!(ElementKind::from_tag("a", None), ElementKind::Link);
        assert_eq!(ElementKind::from_tag("textarea", None), ElementKind::Input);
        assert_eq!(ElementKind::from_tag("div", Some("button")), ElementKind::Button);
        assert_eq!(ElementKind::from_tag("div", None), ElementKind::Element);
    }

    #[test]
    fn test_interactive_element_wire_shape() {
        let el = InteractiveElement {
            index: 1,
            kind: ElementKind::Link,
            selector: "#home".to_string(),
            tag: "a".to_string(),
            text: "Home".to_string(),
        };
        let v = serde_json::to_value(&el).unwrap();
        assert_eq!(v["type"], "LINK");
        assert_eq!(v["index"], 1);
    }
}
