use serde::{Deserialize, Serialize};

// ========================= Action Vocabulary =========================

/// One validated browser action requested by the model.
///
/// Wire shape: `{"action": "<name>", "params": {...}}`. Decoding lives in
/// [`crate::parser`] so that vocabulary violations map to distinct error
/// kinds instead of a generic serde failure.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum Action {
    Navigate { url: String },
    Click { selector: String },
    Input { selector: String, text: String },
    Extract { query: String },
    Screenshot,
    GetElements,
    Scroll { direction: ScrollDirection, amount: i64 },
    GoBack,
    PressKey { key: String },
    GetText,
    Wait { seconds: u64 },
    Reload,
    Done { result: String },
}

impl Action {
    /// The wire name of this action, as the model spells it.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "navigate",
            Action::Click { .. } => "click",
            Action::Input { .. } => "input",
            Action::Extract { .. } => "extract",
            Action::Screenshot => "screenshot",
            Action::GetElements => "get_elements",
            Action::Scroll { .. } => "scroll",
            Action::GoBack => "go_back",
            Action::PressKey { .. } => "press_key",
            Action::GetText => "get_text",
            Action::Wait { .. } => "wait",
            Action::Reload => "reload",
            Action::Done { .. } => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Action::Done { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

pub(crate) const DEFAULT_SCROLL_AMOUNT: i64 = 500;
pub(crate) const DEFAULT_WAIT_SECONDS: u64 = 2;

// ========================= Action Results =========================

/// Outcome of executing one action, fed back to the model as a tool message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub is_done: bool,
}

impl ActionResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: Some(content.into()),
            error: None,
            is_done: false,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            content: None,
            error: Some(message.into()),
            is_done: false,
        }
    }

    /// Terminal result of the `done` sentinel tool.
    pub fn done(result: impl Into<String>) -> Self {
        Self {
            success: true,
            content: Some(result.into()),
            error: None,
            is_done: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_wire_names() {
        assert_eq!(Action::Navigate { url: "https://a.example".into() }.name(), "navigate");
        assert_eq!(Action::GetElements.name(), "get_elements");
        assert_eq!(Action::Done { result: "x".into() }.name(), "done");
    }

    #[test]
    fn serializes_to_wire_shape() {
        let json = serde_json::to_value(Action::Click { selector: "#go".into() }).unwrap();
        assert_eq!(json["action"], "click");
        assert_eq!(json["params"]["selector"], "#go");
    }

    #[test]
    fn unit_variants_serialize_without_params() {
        let json = serde_json::to_value(Action::Screenshot).unwrap();
        assert_eq!(json, serde_json::json!({"action": "screenshot"}));
    }

    #[test]
    fn done_result_is_terminal() {
        let res = ActionResult::done("all set");
        assert!(res.success);
        assert!(res.is_done);
        assert_eq!(res.content.as_deref(), Some("all set"));
    }

    #[test]
    fn err_result_carries_message_only() {
        let res = ActionResult::err("element not found");
        assert!(!res.success);
        assert!(!res.is_done);
        assert!(res.content.is_none());
        assert_eq!(res.error.as_deref(), Some("element not found"));
    }
}
