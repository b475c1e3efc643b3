use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::sleep;

use crate::action::ScrollDirection;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("browser session error: {0}")]
    Session(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("screenshot failed: {0}")]
    Screenshot(String),
}

/// One interactive element, as reported by the page inventory script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementInfo {
    pub index: usize,
    pub tag: String,
    pub text: String,
    #[serde(default)]
    pub id: String,
    pub selector: String,
}

/// The narrow contract tool handlers drive the browser through.
///
/// One driver instance belongs to exactly one agent run; nothing here is
/// shared between runs.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;
    async fn url(&self) -> Result<String, BrowserError>;
    async fn title(&self) -> Result<String, BrowserError>;
    async fn click(&self, selector: &str) -> Result<(), BrowserError>;
    async fn fill(&self, selector: &str, text: &str) -> Result<(), BrowserError>;
    async fn press_key(&self, key: &str) -> Result<(), BrowserError>;
    async fn scroll(&self, direction: ScrollDirection, amount: i64) -> Result<(), BrowserError>;
    async fn go_back(&self) -> Result<(), BrowserError>;
    async fn reload(&self) -> Result<(), BrowserError>;
    async fn page_text(&self) -> Result<String, BrowserError>;
    async fn get_elements_info(&self) -> Result<Vec<ElementInfo>, BrowserError>;
    async fn screenshot_b64(&self) -> Result<String, BrowserError>;
}

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None }
    }
}

pub struct ChromiumBrowser {
    page: Page,
    _browser: OxideBrowser,
}

impl ChromiumBrowser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self, BrowserError> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Use a unique user data dir per run to avoid ProcessSingleton profile
        // lock conflicts when Chromium is restarted rapidly or several runs
        // launch at once.
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("webpilot-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder.user_data_dir(profile_dir.clone());
        builder = builder
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| BrowserError::Launch(e.to_string()))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua)
                .await
                .map_err(|e| BrowserError::Session(e.to_string()))?;
        }
        // Ensure a non-zero viewport to avoid screenshot 0-width errors.
        let _ = page
            .execute(
                SetDeviceMetricsOverrideParams::builder()
                    .width(1280)
                    .height(800)
                    .device_scale_factor(1.0)
                    .mobile(false)
                    .build()
                    .unwrap(),
            )
            .await;
        Ok(Self { page, _browser: browser })
    }

    /// Attach to an already-running Chromium over its devtools websocket.
    pub async fn connect(ws_url: &str) -> Result<Self, BrowserError> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        Ok(Self { page, _browser: browser })
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, script: &str) -> Result<T, BrowserError> {
        self.page
            .evaluate(script)
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?
            .into_value()
            .map_err(|e| BrowserError::Script(e.to_string()))
    }

    /// Fire a script for its side effect, tolerating the context teardown
    /// races navigation-triggering scripts can produce.
    async fn fire(&self, script: String) -> Result<(), BrowserError> {
        let eval = EvaluateParams::builder()
            .expression(script)
            .build()
            .map_err(|e| BrowserError::Script(e.to_string()))?;
        let _ = self.page.execute(eval).await;
        Ok(())
    }

    async fn settle(&self) {
        sleep(Duration::from_millis(400)).await;
    }
}

#[async_trait]
impl BrowserDriver for ChromiumBrowser {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| BrowserError::Navigation(e.to_string()))?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| BrowserError::Navigation(e.to_string()))?;
        self.settle().await;
        Ok(())
    }

    async fn url(&self) -> Result<String, BrowserError> {
        Ok(self
            .page
            .url()
            .await
            .map_err(|e| BrowserError::Session(e.to_string()))?
            .unwrap_or_default())
    }

    async fn title(&self) -> Result<String, BrowserError> {
        self.eval("document.title").await
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))?;
        element
            .click()
            .await
            .map_err(|e| BrowserError::Session(e.to_string()))?;
        self.settle().await;
        Ok(())
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<(), BrowserError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))?;
        element
            .click()
            .await
            .map_err(|e| BrowserError::Session(e.to_string()))?
            .type_str(text)
            .await
            .map_err(|e| BrowserError::Session(e.to_string()))?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), BrowserError> {
        // Dispatch to the focused element so form handlers see the key.
        let js = format!(
            r#"
            (function() {{
              const el = document.activeElement || document.body;
              const opts = {{key: "{key}", code: "{key}", bubbles: true}};
              el.dispatchEvent(new KeyboardEvent("keydown", opts));
              el.dispatchEvent(new KeyboardEvent("keyup", opts));
            }})()
        "#
        );
        self.fire(js).await?;
        self.settle().await;
        Ok(())
    }

    async fn scroll(&self, direction: ScrollDirection, amount: i64) -> Result<(), BrowserError> {
        let (dx, dy) = match direction {
            ScrollDirection::Up => (0, -amount),
            ScrollDirection::Down => (0, amount),
            ScrollDirection::Left => (-amount, 0),
            ScrollDirection::Right => (amount, 0),
        };
        self.fire(format!("window.scrollBy({dx}, {dy});")).await
    }

    async fn go_back(&self) -> Result<(), BrowserError> {
        self.fire("history.back();".to_string()).await?;
        self.settle().await;
        Ok(())
    }

    async fn reload(&self) -> Result<(), BrowserError> {
        self.fire("location.reload();".to_string()).await?;
        self.settle().await;
        Ok(())
    }

    async fn page_text(&self) -> Result<String, BrowserError> {
        self.eval("document.body ? document.body.innerText : \"\"").await
    }

    async fn get_elements_info(&self) -> Result<Vec<ElementInfo>, BrowserError> {
        self.eval(ELEMENTS_SCRIPT).await
    }

    async fn screenshot_b64(&self) -> Result<String, BrowserError> {
        use chromiumoxide::page::ScreenshotParamsBuilder;
        let take = || async {
            self.page
                .screenshot(
                    ScreenshotParamsBuilder::default()
                        .full_page(true)
                        .omit_background(true)
                        .build(),
                )
                .await
        };
        match take().await {
            Ok(bytes) => Ok(STANDARD.encode(bytes)),
            Err(e) => {
                let msg = format!("{}", e);
                if msg.contains("0 width") || msg.contains("0 height") {
                    // Force the viewport and retry once.
                    let _ = self
                        .page
                        .execute(
                            SetDeviceMetricsOverrideParams::builder()
                                .width(1280)
                                .height(800)
                                .device_scale_factor(1.0)
                                .mobile(false)
                                .build()
                                .unwrap(),
                        )
                        .await;
                    sleep(Duration::from_millis(50)).await;
                    let bytes = take()
                        .await
                        .map_err(|e| BrowserError::Screenshot(e.to_string()))?;
                    return Ok(STANDARD.encode(bytes));
                }
                Err(BrowserError::Screenshot(msg))
            }
        }
    }
}

/// Inventory of visible interactive elements, each with a selector the
/// `click` and `input` tools can use directly.
const ELEMENTS_SCRIPT: &str = r#"
(function() {
  const out = [];
  const roots = ['a', 'button', 'input', 'textarea', 'select', '[onclick]', '[role="button"]'];
  const seen = new Set();
  function cssPath(el) {
    if (el.id) return '#' + CSS.escape(el.id);
    const parts = [];
    while (el && el.nodeType === 1 && el !== document.body) {
      let part = el.tagName.toLowerCase();
      const parent = el.parentNode;
      if (parent) {
        const same = Array.from(parent.children).filter(c => c.tagName === el.tagName);
        if (same.length > 1) part += ':nth-of-type(' + (same.indexOf(el) + 1) + ')';
      }
      parts.unshift(part);
      el = parent;
    }
    return parts.length ? 'body > ' + parts.join(' > ') : 'body';
  }
  roots.forEach(sel => {
    document.querySelectorAll(sel).forEach(el => {
      if (seen.has(el)) return;
      const rect = el.getBoundingClientRect();
      if (rect.width <= 0 || rect.height <= 0) return;
      seen.add(el);
      const text = (el.textContent || '').trim() || el.value || el.placeholder || '';
      out.push({
        index: out.length,
        tag: el.tagName.toLowerCase(),
        text: text.substring(0, 100),
        id: el.id || '',
        selector: cssPath(el)
      });
    });
  });
  return out;
})()
"#;
