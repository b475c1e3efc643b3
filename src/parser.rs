use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::action::{Action, ScrollDirection, DEFAULT_SCROLL_AMOUNT, DEFAULT_WAIT_SECONDS};

/// Why a model response could not be turned into an [`Action`].
///
/// Every kind is recoverable: the agent loop feeds it back to the model as a
/// failed tool message and continues.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no action object found in the response")]
    NoActionFound,
    #[error("malformed action JSON: {0}")]
    MalformedJson(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid parameters for {tool}: {message}")]
    BadParams { tool: String, message: String },
}

/// Extract exactly one [`Action`] from raw model output.
///
/// The object may arrive inside a fenced code block or embedded in prose;
/// the first balanced `{...}` span enclosing an `"action"` key wins.
pub fn parse_action(raw: &str) -> Result<Action, ParseError> {
    // A fenced block, when present and well-formed, is the clearest signal.
    if let Some(block) = fenced_block(raw) {
        if let Ok(v) = serde_json::from_str::<Value>(block) {
            if v.get("action").is_some() {
                return decode_action(&v);
            }
        }
    }

    let Some(key_pos) = raw.find("\"action\"") else {
        return Err(ParseError::NoActionFound);
    };
    let Some(start) = raw[..key_pos].rfind('{') else {
        return Err(ParseError::NoActionFound);
    };
    let span = balanced_object(raw, start)
        .ok_or_else(|| ParseError::MalformedJson("unbalanced object braces".into()))?;
    let v: Value =
        serde_json::from_str(span).map_err(|e| ParseError::MalformedJson(e.to_string()))?;
    decode_action(&v)
}

/// Validate a decoded JSON object against the action vocabulary.
pub fn decode_action(v: &Value) -> Result<Action, ParseError> {
    let name = match v.get("action") {
        Some(Value::String(s)) => s.as_str(),
        Some(_) => return Err(ParseError::MalformedJson("\"action\" must be a string".into())),
        None => return Err(ParseError::NoActionFound),
    };
    let empty = Value::Object(serde_json::Map::new());
    let params = v.get("params").unwrap_or(&empty);

    let action = match name {
        "navigate" => Action::Navigate { url: req_str(params, name, "url")? },
        "click" => Action::Click { selector: req_str(params, name, "selector")? },
        "input" => Action::Input {
            selector: req_str(params, name, "selector")?,
            text: req_str(params, name, "text")?,
        },
        "extract" => Action::Extract { query: req_str(params, name, "query")? },
        "screenshot" => Action::Screenshot,
        "get_elements" => Action::GetElements,
        "scroll" => Action::Scroll {
            direction: opt_direction(params, name)?,
            amount: opt_i64(params, name, "amount", DEFAULT_SCROLL_AMOUNT)?,
        },
        "go_back" => Action::GoBack,
        "press_key" => Action::PressKey { key: req_str(params, name, "key")? },
        "get_text" => Action::GetText,
        "wait" => Action::Wait { seconds: opt_u64(params, name, "seconds", DEFAULT_WAIT_SECONDS)? },
        "reload" => Action::Reload,
        "done" => Action::Done { result: req_str(params, name, "result")? },
        other => return Err(ParseError::UnknownTool(other.to_string())),
    };
    Ok(action)
}

fn bad(tool: &str, message: impl Into<String>) -> ParseError {
    ParseError::BadParams { tool: tool.to_string(), message: message.into() }
}

fn req_str(params: &Value, tool: &str, key: &str) -> Result<String, ParseError> {
    match params.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(bad(tool, format!("\"{key}\" must be a string"))),
        None => Err(bad(tool, format!("missing required parameter \"{key}\""))),
    }
}

fn opt_i64(params: &Value, tool: &str, key: &str, default: i64) -> Result<i64, ParseError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v.as_i64().ok_or_else(|| bad(tool, format!("\"{key}\" must be an integer"))),
    }
}

fn opt_u64(params: &Value, tool: &str, key: &str, default: u64) -> Result<u64, ParseError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v.as_u64().ok_or_else(|| bad(tool, format!("\"{key}\" must be a non-negative integer"))),
    }
}

fn opt_direction(params: &Value, tool: &str) -> Result<ScrollDirection, ParseError> {
    match params.get("direction") {
        None | Some(Value::Null) => Ok(ScrollDirection::Down),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|_| bad(tool, "\"direction\" must be one of up/down/left/right")),
    }
}

/// Contents of the first ``` fence, with an optional `json` language tag.
fn fenced_block(raw: &str) -> Option<&str> {
    let open = raw.find("```")?;
    let after = &raw[open + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    // Only treat it as a fence when the header line is empty or a language tag.
    let header = after[..body_start].trim();
    if !header.is_empty() && !header.eq_ignore_ascii_case("json") {
        return None;
    }
    let body = &after[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

/// The balanced `{...}` span starting at `start`. Braces inside JSON string
/// literals do not count toward the depth.
fn balanced_object(raw: &str, start: usize) -> Option<&str> {
    let bytes = raw.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for i in start..bytes.len() {
        let b = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

// Lets serialized reports and histories round-trip through the same
// vocabulary validation the live parser applies.
impl<'de> Deserialize<'de> for Action {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = Value::deserialize(deserializer)?;
        decode_action(&v).map_err(serde::de::Error::custom)
    }
}
