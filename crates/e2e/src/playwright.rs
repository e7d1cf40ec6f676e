//! Playwright browser automation over a Node.js bridge process
//!
//! `node` runs an embedded script that owns the Playwright browser and speaks
//! JSON lines: requests `{id, op, ...}` on stdin, responses `{id, ok, result,
//! error}` and page events `{event, page, ...}` on stdout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::browser::{Browser, BrowserDriver, BrowserPage, PageEvent};
use crate::error::{E2eError, E2eResult};
use crate::logs::{LogSource, LogStore};

const BRIDGE_SCRIPT: &str = r#"
const readline = require('readline');
const playwright = require('playwright');

const send = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');
const pages = new Map();
let nextPage = 1;
let browser;

const page = (id) => {
  const p = pages.get(id);
  if (!p) throw new Error(`unknown page ${id}`);
  return p;
};

const ops = {
  async new_page() {
    const p = await browser.newPage();
    const id = nextPage++;
    pages.set(id, p);
    p.on('console', (msg) => {
      const loc = msg.location();
      send({
        event: 'console', page: id, kind: msg.type(), text: msg.text(),
        location: { url: loc.url, lineNumber: loc.lineNumber, columnNumber: loc.columnNumber },
      });
    });
    p.on('pageerror', (err) => {
      send({ event: 'page_error', page: id, message: String((err && err.message) || err), stack: (err && err.stack) || null });
    });
    return id;
  },
  async goto({ page: id, url }) { await page(id).goto(url); },
  async click({ page: id, selector }) { await page(id).click(selector); },
  async fill({ page: id, selector, value }) { await page(id).fill(selector, value); },
  async press({ page: id, key }) { await page(id).keyboard.press(key); },
  async wait_for_selector({ page: id, selector }) { await page(id).waitForSelector(selector); },
  async text_content({ page: id, selector }) { return await page(id).textContent(selector); },
  async set_default_timeout({ page: id, ms }) { page(id).setDefaultTimeout(ms); },
  async close_page({ page: id }) {
    const p = pages.get(id);
    pages.delete(id);
    if (p) await p.close();
  },
  async close() { await browser.close(); },
};

(async () => {
  try {
    browser = await playwright[process.env.STAGEHAND_BROWSER].launch({
      headless: process.env.STAGEHAND_HEADLESS !== '0',
    });
  } catch (err) {
    send({ event: 'fatal', message: String((err && err.message) || err) });
    process.exit(1);
  }
  send({ event: 'ready' });
  const rl = readline.createInterface({ input: process.stdin });
  for await (const line of rl) {
    if (!line.trim()) continue;
    const req = JSON.parse(line);
    try {
      const result = await ops[req.op](req);
      send({ id: req.id, ok: true, result: result === undefined ? null : result });
    } catch (err) {
      send({ id: req.id, ok: false, error: String((err && err.message) || err) });
    }
    if (req.op === 'close') process.exit(0);
  }
})();
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BrowserKind {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserKind {
    fn as_str(&self) -> &'static str {
        match self {
            BrowserKind::Chromium => "chromium",
            BrowserKind::Firefox => "firefox",
            BrowserKind::Webkit => "webkit",
        }
    }
}

/// Playwright configuration
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub browser: BrowserKind,
    pub headless: bool,
    /// Node.js executable
    pub node: String,
    /// Directory `playwright` is resolved from
    pub cwd: PathBuf,
    /// How long launching the browser may take
    pub launch_timeout: Duration,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: BrowserKind::Chromium,
            headless: true,
            node: "node".to_string(),
            cwd: PathBuf::from("."),
            launch_timeout: Duration::from_secs(60),
        }
    }
}

/// Launches browsers through the Node.js bridge; its stderr goes to the log store.
pub struct PlaywrightDriver {
    config: PlaywrightConfig,
    logs: LogStore,
}

impl PlaywrightDriver {
    pub fn new(config: PlaywrightConfig, logs: LogStore) -> Self {
        Self { config, logs }
    }
}

#[derive(Debug, Deserialize)]
struct Response {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

type Pending = oneshot::Sender<Result<Value, String>>;

struct Bridge {
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: tokio::sync::Mutex<Child>,
    pending: Mutex<HashMap<u64, Pending>>,
    pages: Mutex<HashMap<u64, mpsc::UnboundedSender<PageEvent>>>,
    next_id: AtomicU64,
}

impl Bridge {
    async fn request(&self, op: &str, mut params: Value) -> E2eResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Value::Object(map) = &mut params {
            map.insert("id".into(), json!(id));
            map.insert("op".into(), json!(op));
        }
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let mut line = serde_json::to_string(&params)?;
        line.push('\n');
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.pending.lock().remove(&id);
                return Err(E2eError::Browser(format!("Playwright bridge is gone: {}", e)));
            }
            stdin.flush().await?;
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => Err(E2eError::Browser(format!("{} failed: {}", op, message))),
            Err(_) => Err(E2eError::Browser(format!(
                "Playwright bridge exited during `{}`",
                op
            ))),
        }
    }

    fn route(&self, line: &str, launched: &mut Option<oneshot::Sender<Result<(), String>>>) {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => {
                debug!("Ignoring non-JSON bridge output: {}", line);
                return;
            }
        };

        if value.get("id").is_some() {
            match serde_json::from_value::<Response>(value) {
                Ok(response) => {
                    if let Some(tx) = self.pending.lock().remove(&response.id) {
                        let outcome = if response.ok {
                            Ok(response.result)
                        } else {
                            Err(response.error.unwrap_or_else(|| "unknown error".into()))
                        };
                        let _ = tx.send(outcome);
                    }
                }
                Err(e) => warn!("Malformed bridge response: {}", e),
            }
            return;
        }

        match value.get("event").and_then(Value::as_str) {
            Some("ready") => {
                if let Some(tx) = launched.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Some("fatal") => {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("browser launch failed")
                    .to_string();
                if let Some(tx) = launched.take() {
                    let _ = tx.send(Err(message));
                }
            }
            Some(_) => {
                let Some(page) = value.get("page").and_then(Value::as_u64) else {
                    return;
                };
                match serde_json::from_value::<PageEvent>(value) {
                    Ok(event) => {
                        if let Some(tx) = self.pages.lock().get(&page) {
                            let _ = tx.send(event);
                        }
                    }
                    Err(e) => warn!("Malformed page event: {}", e),
                }
            }
            None => {}
        }
    }

    /// Fail every in-flight request and end every page stream.
    fn disconnect(&self) {
        self.pending.lock().clear();
        self.pages.lock().clear();
    }
}

#[async_trait]
impl BrowserDriver for PlaywrightDriver {
    async fn launch(&self) -> E2eResult<Box<dyn Browser>> {
        info!(browser = self.config.browser.as_str(), "Launching browser");

        let mut child = Command::new(&self.config.node)
            .arg("-e")
            .arg(BRIDGE_SCRIPT)
            .current_dir(&self.config.cwd)
            .env("STAGEHAND_BROWSER", self.config.browser.as_str())
            .env("STAGEHAND_HEADLESS", if self.config.headless { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                E2eError::Browser(format!(
                    "failed to start `{}` for Playwright: {}",
                    self.config.node, e
                ))
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(E2eError::bug("Playwright bridge spawned without piped stdio"));
        };

        let bridge = Arc::new(Bridge {
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(child),
            pending: Mutex::new(HashMap::new()),
            pages: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });

        let logs = self.logs.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logs.add(LogSource::Driver, line);
            }
        });

        let (launched_tx, launched_rx) = oneshot::channel();
        let reader = bridge.clone();
        tokio::spawn(async move {
            let mut launched = Some(launched_tx);
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                reader.route(&line, &mut launched);
            }
            debug!("Playwright bridge stdout closed");
            reader.disconnect();
        });

        match tokio::time::timeout(self.config.launch_timeout, launched_rx).await {
            Ok(Ok(Ok(()))) => Ok(Box::new(PlaywrightBrowser { bridge })),
            Ok(Ok(Err(message))) => Err(E2eError::Browser(message)),
            Ok(Err(_)) => Err(E2eError::Browser(
                "Playwright bridge exited before the browser launched; is `playwright` installed?".into(),
            )),
            Err(_) => Err(E2eError::Browser(format!(
                "browser did not launch within {:?}",
                self.config.launch_timeout
            ))),
        }
    }
}

pub struct PlaywrightBrowser {
    bridge: Arc<Bridge>,
}

#[async_trait]
impl Browser for PlaywrightBrowser {
    async fn new_page(&self) -> E2eResult<Box<dyn BrowserPage>> {
        let result = self.bridge.request("new_page", json!({})).await?;
        let id = result
            .as_u64()
            .ok_or_else(|| E2eError::Browser(format!("unexpected page id {}", result)))?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.bridge.pages.lock().insert(id, tx);
        Ok(Box::new(PlaywrightPage {
            bridge: self.bridge.clone(),
            id,
            events: Mutex::new(Some(rx)),
        }))
    }

    async fn close(&self) -> E2eResult<()> {
        self.bridge.request("close", json!({})).await?;
        let mut child = self.bridge.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
            Ok(status) => {
                debug!("Playwright bridge exited: {:?}", status);
            }
            Err(_) => {
                warn!("Playwright bridge did not exit, killing it");
                child.kill().await?;
            }
        }
        Ok(())
    }
}

pub struct PlaywrightPage {
    bridge: Arc<Bridge>,
    id: u64,
    events: Mutex<Option<mpsc::UnboundedReceiver<PageEvent>>>,
}

impl PlaywrightPage {
    async fn call(&self, op: &str, mut params: Value) -> E2eResult<Value> {
        if let Value::Object(map) = &mut params {
            map.insert("page".into(), json!(self.id));
        }
        self.bridge.request(op, params).await
    }
}

#[async_trait]
impl BrowserPage for PlaywrightPage {
    async fn goto(&self, url: &str) -> E2eResult<()> {
        self.call("goto", json!({ "url": url })).await.map(drop)
    }

    async fn click(&self, selector: &str) -> E2eResult<()> {
        self.call("click", json!({ "selector": selector })).await.map(drop)
    }

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()> {
        self.call("fill", json!({ "selector": selector, "value": value }))
            .await
            .map(drop)
    }

    async fn press(&self, key: &str) -> E2eResult<()> {
        self.call("press", json!({ "key": key })).await.map(drop)
    }

    async fn wait_for_selector(&self, selector: &str) -> E2eResult<()> {
        self.call("wait_for_selector", json!({ "selector": selector }))
            .await
            .map(drop)
    }

    async fn text_content(&self, selector: &str) -> E2eResult<Option<String>> {
        let result = self.call("text_content", json!({ "selector": selector })).await?;
        Ok(result.as_str().map(str::to_string))
    }

    async fn set_default_timeout(&self, timeout: Duration) -> E2eResult<()> {
        self.call("set_default_timeout", json!({ "ms": timeout.as_millis() as u64 }))
            .await
            .map(drop)
    }

    async fn close(&self) -> E2eResult<()> {
        let result = self.call("close_page", json!({})).await.map(drop);
        self.bridge.pages.lock().remove(&self.id);
        result
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PageEvent>> {
        self.events.lock().take()
    }
}
