use crate::agent::{ActionOutcome, AgentError, Computer};
use crate::types::{now_ms, Action, ActionKind, PageElement, PageState, ScreenPosition, Viewport};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, InsertTextParams, MouseButton,
};
use chromiumoxide::handler::Handler;
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: Viewport,
    /// Attach to a running Chromium instead of launching one.
    pub ws_url: Option<String>,
    /// Elements of each kind reported per capture.
    pub element_limit: usize,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
            viewport: Viewport::default(),
            ws_url: env::var("CHROME_WS_URL").ok().filter(|s| !s.trim().is_empty()),
            element_limit: 60,
        }
    }
}

/// Single-page Chromium session.
pub struct Browser {
    page: Page,
    browser: OxideBrowser,
    handler: JoinHandle<()>,
    owned: bool,
    viewport: Viewport,
}

fn drive(mut handler: Handler) -> JoinHandle<()> {
    tokio::spawn(async move { while let Some(_ev) = handler.next().await {} })
}

impl Browser {
    pub async fn launch(cfg: &BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // unique profile per run, Chromium refuses to share a locked one
        let mut profile_dir: PathBuf = env::temp_dir();
        profile_dir.push(format!("demo-pilot-profile-{}-{}", std::process::id(), now_ms()));
        std::fs::create_dir_all(&profile_dir)?;
        builder = builder
            .user_data_dir(profile_dir)
            .window_size(cfg.viewport.width, cfg.viewport.height)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, handler) = OxideBrowser::launch(bcfg).await?;
        let handler = drive(handler);
        Self::open(browser, handler, true, cfg).await
    }

    pub async fn connect(cfg: &BrowserConfig, ws_url: &str) -> Result<Self> {
        let (browser, handler) = OxideBrowser::connect(ws_url).await?;
        let handler = drive(handler);
        Self::open(browser, handler, false, cfg).await
    }

    async fn open(browser: OxideBrowser, handler: JoinHandle<()>, owned: bool, cfg: &BrowserConfig) -> Result<Self> {
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = &cfg.user_agent {
            page.set_user_agent(ua.clone()).await?;
        }
        let this = Self { page, browser, handler, owned, viewport: cfg.viewport };
        this.apply_viewport().await?;
        Ok(this)
    }

    // a zero-sized viewport breaks screenshots
    async fn apply_viewport(&self) -> Result<()> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(self.viewport.width as i64)
            .height(self.viewport.height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(metrics).await?;
        Ok(())
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    pub async fn title(&self) -> Result<String> {
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    /// Evaluates an expression; `Value::Null` when it yields nothing serializable.
    pub async fn evaluate(&self, script: &str) -> Result<Value> {
        let result = self.page.evaluate(script).await?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    pub async fn move_mouse(&self, x: f64, y: f64) -> Result<()> {
        self.page.move_mouse(Point { x, y }).await?;
        Ok(())
    }

    pub async fn click(&self, x: f64, y: f64) -> Result<()> {
        let cmd = DispatchMouseEventParams::builder()
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1);
        let press = cmd
            .clone()
            .r#type(DispatchMouseEventType::MousePressed)
            .build()
            .map_err(|e| anyhow!(e))?;
        let release = cmd
            .r#type(DispatchMouseEventType::MouseReleased)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.move_mouse(Point { x, y }).await?.execute(press).await?;
        self.page.execute(release).await?;
        Ok(())
    }

    /// Center of the first element matching `selector`, scrolled into view.
    pub async fn locate(&self, selector: &str) -> Result<Option<Point>> {
        let element = match self.page.find_element(selector).await {
            Ok(el) => el,
            Err(e) => {
                debug!(selector, error = %e, "element not found");
                return Ok(None);
            }
        };
        element.scroll_into_view().await?;
        Ok(Some(element.clickable_point().await?))
    }

    async fn require(&self, selector: &str) -> Result<Point> {
        self.locate(selector)
            .await?
            .ok_or_else(|| anyhow!("no element matches {selector}"))
    }

    pub async fn click_selector(&self, selector: &str) -> Result<()> {
        let p = self.require(selector).await?;
        self.click(p.x, p.y).await
    }

    pub async fn hover_selector(&self, selector: &str) -> Result<()> {
        let p = self.require(selector).await?;
        self.move_mouse(p.x, p.y).await
    }

    /// Inserts text into the focused element.
    pub async fn type_text(&self, text: &str) -> Result<()> {
        self.page.execute(InsertTextParams { text: text.to_string() }).await?;
        Ok(())
    }

    async fn clear_focused(&self) -> Result<()> {
        self.evaluate(
            "(() => { const el = document.activeElement; \
             if (el && 'value' in el) { el.value = ''; el.dispatchEvent(new Event('input', {bubbles: true})); } })()",
        )
        .await?;
        Ok(())
    }

    /// Chooses an option by value or visible text. `element` is a JS expression.
    async fn select_in(&self, element: &str, choice: &str) -> Result<()> {
        let choice = serde_json::to_string(choice)?;
        let script = format!(
            r#"(() => {{
              const el = {element};
              if (!el) return 'missing';
              const want = {choice};
              if (el.tagName !== 'SELECT') {{ el.click(); return 'clicked'; }}
              const opt = Array.from(el.options).find(o => o.value === want || o.text.trim() === want);
              if (!opt) return 'no-option';
              el.value = opt.value;
              el.dispatchEvent(new Event('input', {{bubbles: true}}));
              el.dispatchEvent(new Event('change', {{bubbles: true}}));
              return 'ok';
            }})()"#
        );
        match self.evaluate(&script).await?.as_str() {
            Some("ok") | Some("clicked") => Ok(()),
            Some("no-option") => Err(anyhow!("no option matches {choice}")),
            _ => Err(anyhow!("select target not found")),
        }
    }

    pub async fn select_selector(&self, selector: &str, choice: &str) -> Result<()> {
        let target = serde_json::to_string(selector)?;
        self.select_in(&format!("document.querySelector({target})"), choice).await
    }

    pub async fn select_at(&self, x: f64, y: f64, choice: &str) -> Result<()> {
        self.select_in(&format!("document.elementFromPoint({x}, {y})"), choice).await
    }

    pub async fn scroll(&self, dx: i64, dy: i64) -> Result<()> {
        self.evaluate(&format!("window.scrollBy({dx}, {dy})")).await?;
        Ok(())
    }

    pub async fn inner_text(&self, selector: Option<&str>) -> Result<String> {
        let script = match selector {
            Some(sel) => format!(
                "(() => {{ const el = document.querySelector({}); return el ? el.innerText : null; }})()",
                serde_json::to_string(sel)?
            ),
            None => "document.body ? document.body.innerText : ''".to_string(),
        };
        match self.evaluate(&script).await? {
            Value::String(s) => Ok(s),
            _ => Err(anyhow!("nothing to extract")),
        }
    }

    pub async fn screenshot_png(&self) -> Result<Vec<u8>> {
        let take = || async { self.page.screenshot(ScreenshotParams::builder().build()).await };
        match take().await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    self.apply_viewport().await?;
                    sleep(Duration::from_millis(50)).await;
                    return Ok(take().await?);
                }
                Err(anyhow!(e))
            }
        }
    }

    /// Waits for the document to finish loading, then lets it settle.
    pub async fn wait_for_stable(&self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.evaluate("document.readyState").await?.as_str() == Some("complete") {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        sleep(Duration::from_millis(300)).await;
        Ok(())
    }

    pub async fn dom_state(&self, limit: usize) -> Result<DomState> {
        let script = DOM_STATE_JS.replace("__LIMIT__", &limit.to_string());
        let value = self.evaluate(&script).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Closes the page, and the whole browser when this session launched it.
    pub async fn close(self) -> Result<()> {
        let Self { page, mut browser, handler, owned, .. } = self;
        if owned {
            browser.close().await?;
            let _ = browser.wait().await;
        } else {
            page.close().await?;
        }
        handler.abort();
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DomState {
    pub visible_text: Vec<String>,
    pub clickable: Vec<PageElement>,
    pub inputs: Vec<PageElement>,
    pub selectables: Vec<PageElement>,
    pub viewport: Option<Viewport>,
}

const DOM_STATE_JS: &str = r##"(() => {
  const LIMIT = __LIMIT__;
  const visible = el => {
    const r = el.getBoundingClientRect();
    const s = getComputedStyle(el);
    return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none';
  };
  const quote = v => v.replace(/\\/g, '\\\\').replace(/"/g, '\\"');
  const selectorFor = el => {
    if (el.id) return '#' + CSS.escape(el.id);
    const tag = el.tagName.toLowerCase();
    for (const a of ['data-testid', 'name', 'aria-label']) {
      const v = el.getAttribute(a);
      if (!v) continue;
      const s = `${tag}[${a}="${quote(v)}"]`;
      if (document.querySelectorAll(s).length === 1) return s;
    }
    const path = [];
    for (let n = el; n && n.nodeType === 1 && n !== document.body; n = n.parentElement) {
      const t = n.tagName.toLowerCase();
      const same = n.parentElement ? Array.from(n.parentElement.children).filter(c => c.tagName === n.tagName) : [];
      path.unshift(same.length > 1 ? `${t}:nth-of-type(${same.indexOf(n) + 1})` : t);
    }
    return 'body > ' + path.join(' > ');
  };
  const text = el => (el.innerText || el.value || '').trim().replace(/\s+/g, ' ').slice(0, 120);
  const hints = el => {
    const out = [];
    for (const a of ['aria-label', 'placeholder', 'title', 'name', 'type', 'href']) {
      const v = el.getAttribute(a);
      if (v) out.push(v);
    }
    if (el.labels) for (const l of el.labels) out.push(l.innerText.trim());
    if (el.tagName === 'SELECT') for (const o of el.options) out.push(o.text.trim());
    return out.filter(Boolean).slice(0, 12);
  };
  const collect = sel => Array.from(document.querySelectorAll(sel))
    .filter(visible)
    .slice(0, LIMIT)
    .map(el => ({ selector: selectorFor(el), text: text(el), hints: hints(el) }));
  const lines = (document.body ? document.body.innerText : '').split('\n').map(s => s.trim()).filter(Boolean);
  return {
    visible_text: [...new Set(lines)].slice(0, 200).map(s => s.slice(0, 200)),
    clickable: collect('a[href], button, [role=button], [role=link], [role=menuitem], [role=tab], input[type=submit], input[type=button], summary, [onclick]'),
    inputs: collect('input:not([type=hidden]):not([type=submit]):not([type=button]):not([type=checkbox]):not([type=radio]), textarea, [contenteditable=true]'),
    selectables: collect('select, [role=combobox], [role=listbox], input[type=checkbox], input[type=radio]'),
    viewport: { width: window.innerWidth, height: window.innerHeight },
  };
})()"##;

// ========================= Computer adapter =========================

/// [`Computer`] backed by Chromium over CDP. The browser starts in `initialize`.
pub struct ChromiumComputer {
    cfg: BrowserConfig,
    browser: Mutex<Option<Browser>>,
}

fn surface(e: impl std::fmt::Display) -> AgentError {
    AgentError::Computer(e.to_string())
}

/// Pixels for a scroll value: a number, or `up`/`down`/`top`/`bottom`.
fn scroll_delta(value: Option<&str>, viewport: Viewport) -> i64 {
    let page = (viewport.height as i64 * 3) / 4;
    match value.map(str::trim) {
        Some("up") => -page,
        Some("top") => -1_000_000,
        Some("bottom") => 1_000_000,
        Some(v) => v.parse::<i64>().unwrap_or(page),
        None => page,
    }
}

/// Seconds for a wait value, capped at ten.
/// Wait values are milliseconds; an explicit `s` suffix is accepted for seconds.
fn wait_duration(value: Option<&str>) -> Duration {
    let millis = value
        .map(str::trim)
        .and_then(|v| match v.strip_suffix("ms") {
            Some(ms) => ms.trim().parse::<f64>().ok(),
            None => match v.strip_suffix('s') {
                Some(secs) => secs.trim().parse::<f64>().ok().map(|s| s * 1000.0),
                None => v.parse::<f64>().ok(),
            },
        })
        .filter(|ms| ms.is_finite())
        .unwrap_or(1000.0)
        .clamp(0.0, 10_000.0);
    Duration::from_millis(millis as u64)
}

impl ChromiumComputer {
    pub fn new(cfg: BrowserConfig) -> Self {
        Self { cfg, browser: Mutex::new(None) }
    }

    async fn dispatch(&self, b: &Browser, action: &Action) -> Result<Option<String>> {
        let locator = action.locator.as_deref();
        let point = action.coordinate.as_ref().map(|c| (c.x, c.y));
        let value = action.value.as_deref();
        let missing = || anyhow!("{} needs a locator or coordinate", action.kind);

        match action.kind {
            ActionKind::Navigate => {
                let url = value.ok_or_else(|| anyhow!("navigate without url"))?;
                b.goto(url).await?;
            }
            ActionKind::Click => b.click_selector(locator.ok_or_else(missing)?).await?,
            ActionKind::ClickAt => {
                let (x, y) = point.ok_or_else(missing)?;
                b.click(x, y).await?;
            }
            ActionKind::Type | ActionKind::TypeAt => {
                match (locator, point) {
                    (Some(sel), _) if action.kind == ActionKind::Type => b.click_selector(sel).await?,
                    (_, Some((x, y))) => b.click(x, y).await?,
                    _ => return Err(missing()),
                }
                b.clear_focused().await?;
                b.type_text(value.unwrap_or_default()).await?;
            }
            ActionKind::Hover => b.hover_selector(locator.ok_or_else(missing)?).await?,
            ActionKind::HoverAt => {
                let (x, y) = point.ok_or_else(missing)?;
                b.move_mouse(x, y).await?;
            }
            ActionKind::Select => {
                b.select_selector(locator.ok_or_else(missing)?, value.unwrap_or_default()).await?;
            }
            ActionKind::SelectAt => {
                let (x, y) = point.ok_or_else(missing)?;
                b.select_at(x, y, value.unwrap_or_default()).await?;
            }
            ActionKind::Wait => match locator {
                Some(sel) => {
                    let deadline = Instant::now() + wait_duration(value).max(Duration::from_secs(5));
                    while b.locate(sel).await?.is_none() {
                        if Instant::now() >= deadline {
                            return Err(anyhow!("{sel} did not appear"));
                        }
                        sleep(Duration::from_millis(200)).await;
                    }
                }
                None => sleep(wait_duration(value)).await,
            },
            ActionKind::Scroll => match locator {
                Some(sel) => {
                    b.require(sel).await?;
                }
                None => b.scroll(0, scroll_delta(value, b.viewport())).await?,
            },
            ActionKind::Extract => return Ok(Some(b.inner_text(locator).await?)),
            ActionKind::Evaluate => {
                let script = value.ok_or_else(|| anyhow!("evaluate without script"))?;
                let out = b.evaluate(script).await?;
                return Ok(Some(out.to_string()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Computer for ChromiumComputer {
    async fn initialize(&self) -> Result<(), AgentError> {
        let mut slot = self.browser.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let browser = match &self.cfg.ws_url {
            Some(ws) => {
                info!(ws_url = %ws, "attaching to running browser");
                Browser::connect(&self.cfg, ws).await
            }
            None => {
                info!(headless = self.cfg.headless, "launching browser");
                Browser::launch(&self.cfg).await
            }
        }
        .map_err(surface)?;
        *slot = Some(browser);
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), AgentError> {
        let guard = self.browser.lock().await;
        let b = guard.as_ref().ok_or(AgentError::NotInitialized)?;
        b.goto(url).await.map_err(surface)?;
        b.wait_for_stable().await.map_err(surface)
    }

    async fn perform_action(&self, action: &Action) -> Result<ActionOutcome, AgentError> {
        let guard = self.browser.lock().await;
        let b = guard.as_ref().ok_or(AgentError::NotInitialized)?;
        debug!(kind = %action.kind, locator = ?action.locator, "performing action");
        match self.dispatch(b, action).await {
            Ok(output) => {
                if let Err(e) = b.wait_for_stable().await {
                    warn!(error = %e, "page did not settle");
                }
                Ok(ActionOutcome { success: true, error: None, output })
            }
            Err(e) => Ok(ActionOutcome::failed(e.to_string())),
        }
    }

    async fn capture_state(&self, with_screenshot: bool) -> Result<PageState, AgentError> {
        let guard = self.browser.lock().await;
        let b = guard.as_ref().ok_or(AgentError::NotInitialized)?;
        let dom = b.dom_state(self.cfg.element_limit).await.map_err(surface)?;
        let screenshot = if with_screenshot {
            match b.screenshot_png().await {
                Ok(png) => Some(png),
                Err(e) => {
                    warn!(error = %e, "screenshot failed");
                    None
                }
            }
        } else {
            None
        };
        Ok(PageState {
            url: b.url().await.map_err(surface)?,
            title: b.title().await.map_err(surface)?,
            visible_text: dom.visible_text,
            clickable: dom.clickable,
            inputs: dom.inputs,
            selectables: dom.selectables,
            screenshot,
            viewport: dom.viewport.unwrap_or_else(|| b.viewport()),
            captured_at_ms: now_ms(),
        })
    }

    async fn locate_on_screen(&self, locator: &str) -> Result<Option<ScreenPosition>, AgentError> {
        let guard = self.browser.lock().await;
        let b = guard.as_ref().ok_or(AgentError::NotInitialized)?;
        let point = b.locate(locator).await.map_err(surface)?;
        Ok(point.map(|p| ScreenPosition { x: p.x, y: p.y }))
    }

    async fn shutdown(&self) -> Result<(), AgentError> {
        let Some(browser) = self.browser.lock().await.take() else {
            return Ok(());
        };
        browser.close().await.map_err(surface)
    }
}
