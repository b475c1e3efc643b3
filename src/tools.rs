use std::sync::Arc;

use tracing::warn;

use crate::action::{Action, ActionResult};
use crate::browser::{BrowserDriver, BrowserError, ElementInfo};

const EXTRACT_TEXT_CAP: usize = 8000;
const PAGE_TEXT_CAP: usize = 4000;
const ELEMENTS_TEXT_CAP: usize = 4000;

// Pages that interpose a human-verification wall tend to say so in the
// title or body; the model is told to hand control back when they do.
const CAPTCHA_MARKERS: &[&str] = &[
    "captcha",
    "verify you are human",
    "just a moment",
    "checking your browser",
    "security check",
    "are you a robot",
];

/// Maps validated actions onto the browser driver.
///
/// Dispatch never fails at the signature level: driver errors are folded
/// into `ActionResult::err` so the loop can feed them back to the model.
/// The registration table is the exhaustive match below; a vocabulary
/// variant without a handler arm is a compile error.
pub struct Dispatcher {
    driver: Arc<dyn BrowserDriver>,
}

impl Dispatcher {
    pub fn new(driver: Arc<dyn BrowserDriver>) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &Arc<dyn BrowserDriver> {
        &self.driver
    }

    pub async fn dispatch(&self, action: &Action) -> ActionResult {
        // Sentinel: signals termination, touches nothing.
        if let Action::Done { result } = action {
            return ActionResult::done(result.clone());
        }

        let outcome = match action {
            Action::Navigate { url } => self.navigate(url).await,
            Action::Click { selector } => self.click(selector).await,
            Action::Input { selector, text } => self.input(selector, text).await,
            Action::Extract { query } => self.extract(query).await,
            Action::Screenshot => self.screenshot().await,
            Action::GetElements => self.get_elements().await,
            Action::Scroll { direction, amount } => {
                self.driver.scroll(*direction, *amount).await.map(|_| {
                    format!("Scrolled {} by {} pixels", direction_label(*direction), amount)
                })
            }
            Action::GoBack => self.go_back().await,
            Action::PressKey { key } => {
                self.driver.press_key(key).await.map(|_| format!("Pressed key: {key}"))
            }
            Action::GetText => self.get_text().await,
            Action::Wait { seconds } => {
                tokio::time::sleep(std::time::Duration::from_secs(*seconds)).await;
                Ok(format!("Waited {seconds} seconds"))
            }
            Action::Reload => self.reload().await,
            Action::Done { .. } => unreachable!("handled above"),
        };

        match outcome {
            Ok(content) => ActionResult::ok(content),
            Err(e) => {
                warn!(tool = action.name(), error = %e, "tool execution failed");
                ActionResult::err(e.to_string())
            }
        }
    }

    async fn navigate(&self, url: &str) -> Result<String, BrowserError> {
        self.driver.navigate(url).await?;
        let title = self.driver.title().await.unwrap_or_default();
        let mut content = format!("Navigated to {url} (title: {title})");

        let body = self.driver.page_text().await.unwrap_or_default();
        let haystack = format!("{title}\n{body}").to_lowercase();
        if CAPTCHA_MARKERS.iter().any(|m| haystack.contains(m)) {
            content.push_str(
                "\nThe page looks like a human-verification challenge; it may need to be completed manually before automation can continue.",
            );
        }
        Ok(content)
    }

    async fn click(&self, selector: &str) -> Result<String, BrowserError> {
        self.driver.click(selector).await?;
        Ok(format!("Clicked element: {selector}"))
    }

    async fn input(&self, selector: &str, text: &str) -> Result<String, BrowserError> {
        self.driver.fill(selector, text).await?;
        Ok(format!("Typed into {selector}"))
    }

    /// The page content travels back to the model, which performs the actual
    /// extraction on its next turn.
    async fn extract(&self, query: &str) -> Result<String, BrowserError> {
        let title = self.driver.title().await.unwrap_or_default();
        let url = self.driver.url().await.unwrap_or_default();
        let text = truncate_tail(&self.driver.page_text().await?, EXTRACT_TEXT_CAP);
        Ok(format!(
            "Page title: {title}\nURL: {url}\n\n=== Page content ===\n{text}\n\n=== Extraction request ===\nUsing the page content above, {query}"
        ))
    }

    async fn screenshot(&self) -> Result<String, BrowserError> {
        // Image bytes stay out of the text transcript.
        let b64 = self.driver.screenshot_b64().await?;
        Ok(format!("Captured screenshot ({} KiB encoded)", b64.len() / 1024))
    }

    async fn get_elements(&self) -> Result<String, BrowserError> {
        let elements = self.driver.get_elements_info().await?;
        let listing = format_elements(&elements, ELEMENTS_TEXT_CAP);
        Ok(format!("Found {} interactive elements:\n{listing}", elements.len()))
    }

    async fn go_back(&self) -> Result<String, BrowserError> {
        self.driver.go_back().await?;
        let url = self.driver.url().await.unwrap_or_default();
        Ok(format!("Went back to: {url}"))
    }

    async fn get_text(&self) -> Result<String, BrowserError> {
        let title = self.driver.title().await.unwrap_or_default();
        let url = self.driver.url().await.unwrap_or_default();
        let text = squeeze_whitespace(&split_cap(&self.driver.page_text().await?, PAGE_TEXT_CAP));
        Ok(format!("Page: {title}\nURL: {url}\n\n{text}"))
    }

    async fn reload(&self) -> Result<String, BrowserError> {
        self.driver.reload().await?;
        let title = self.driver.title().await.unwrap_or_default();
        let url = self.driver.url().await.unwrap_or_default();
        Ok(format!("Page reloaded: {title} ({url})"))
    }
}

/// Tool catalogue embedded in the system prompt, one line per tool.
pub fn catalogue() -> &'static str {
    r#"Available tools:
1. navigate(url) - open a URL
2. click(selector) - click an element by CSS selector
3. input(selector, text) - type text into an input field
4. extract(query) - return the page content together with an extraction request
5. screenshot() - capture the current page
6. get_elements() - list the interactive elements with usable selectors
7. scroll(direction, amount) - scroll the page; direction up/down/left/right, amount in pixels (default 500)
8. go_back() - return to the previous page
9. press_key(key) - press a key such as "Enter", "Tab" or "Escape"
10. get_text() - return the visible text of the current page
11. wait(seconds) - pause for the given number of seconds (default 2)
12. reload() - refresh the current page
13. done(result) - finish the task; result must summarize the outcome

Reply with exactly one JSON object:
{
    "action": "<tool name>",
    "params": {"<name>": "<value>"}
}"#
}

fn direction_label(direction: crate::action::ScrollDirection) -> &'static str {
    use crate::action::ScrollDirection::*;
    match direction {
        Up => "up",
        Down => "down",
        Left => "left",
        Right => "right",
    }
}

fn format_elements(elements: &[ElementInfo], cap: usize) -> String {
    let mut out = String::new();
    for el in elements {
        let line = format!("[{}] <{}> {} -- selector: {}\n", el.index, el.tag, el.text, el.selector);
        if out.len() + line.len() > cap {
            out.push_str("...(list truncated)\n");
            break;
        }
        out.push_str(&line);
    }
    out
}

/// Cut at `cap` characters, on a char boundary, marking the cut.
fn truncate_tail(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let cut = floor_char_boundary(text, cap);
    format!("{}\n...(content truncated)", &text[..cut])
}

/// Keep the head and tail of an oversized page, dropping the middle: the top
/// carries navigation and headings, the bottom carries totals and footers.
fn split_cap(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let head = floor_char_boundary(text, cap * 6 / 10);
    let tail_len = cap * 3 / 10;
    let tail_start = ceil_char_boundary(text, text.len() - tail_len);
    format!(
        "{}\n\n...(middle of the page omitted)...\n\n{}",
        &text[..head],
        &text[tail_start..]
    )
}

fn floor_char_boundary(text: &str, mut i: usize) -> usize {
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(text: &str, mut i: usize) -> usize {
    while i < text.len() && !text.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn squeeze_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0usize;
    let mut spaces = 0usize;
    for c in text.chars() {
        match c {
            '\n' => {
                newlines += 1;
                spaces = 0;
                if newlines <= 2 {
                    out.push('\n');
                }
            }
            ' ' | '\t' => {
                spaces += 1;
                if spaces <= 1 {
                    out.push(' ');
                }
            }
            _ => {
                newlines = 0;
                spaces = 0;
                out.push(c);
            }
        }
    }
    out
}
