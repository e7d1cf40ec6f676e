//! In-memory browser used by the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stagehand_e2e::browser::{Browser, BrowserDriver, BrowserPage, PageEvent};
use stagehand_e2e::E2eResult;
use tokio::sync::mpsc;

/// What the pages of a [`FakeBrowser`] were asked to do.
#[derive(Default)]
pub struct Recorder {
    pub visited: Mutex<Vec<String>>,
    pub pages_opened: Mutex<usize>,
    pub pages_closed: Mutex<usize>,
    pub browser_closed: Mutex<bool>,
    /// Sender of the most recently opened page's event stream
    pub events: Mutex<Option<mpsc::UnboundedSender<PageEvent>>>,
}

impl Recorder {
    /// Emit an event from the current page.
    pub fn emit(&self, event: PageEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeBrowser {
    pub recorder: Arc<Recorder>,
}

pub struct FakePage {
    recorder: Arc<Recorder>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PageEvent>>>,
}

#[async_trait]
impl BrowserDriver for FakeBrowser {
    async fn launch(&self) -> E2eResult<Box<dyn Browser>> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn new_page(&self) -> E2eResult<Box<dyn BrowserPage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.recorder.events.lock() = Some(tx);
        *self.recorder.pages_opened.lock() += 1;
        Ok(Box::new(FakePage {
            recorder: self.recorder.clone(),
            events: Mutex::new(Some(rx)),
        }))
    }

    async fn close(&self) -> E2eResult<()> {
        *self.recorder.browser_closed.lock() = true;
        Ok(())
    }
}

#[async_trait]
impl BrowserPage for FakePage {
    async fn goto(&self, url: &str) -> E2eResult<()> {
        self.recorder.visited.lock().push(url.to_string());
        Ok(())
    }

    async fn click(&self, _selector: &str) -> E2eResult<()> {
        Ok(())
    }

    async fn fill(&self, _selector: &str, _value: &str) -> E2eResult<()> {
        Ok(())
    }

    async fn press(&self, _key: &str) -> E2eResult<()> {
        Ok(())
    }

    async fn wait_for_selector(&self, _selector: &str) -> E2eResult<()> {
        Ok(())
    }

    async fn text_content(&self, _selector: &str) -> E2eResult<Option<String>> {
        Ok(Some("Hello".into()))
    }

    async fn set_default_timeout(&self, _timeout: Duration) -> E2eResult<()> {
        Ok(())
    }

    async fn close(&self) -> E2eResult<()> {
        *self.recorder.pages_closed.lock() += 1;
        // Closing the page ends its event stream.
        self.recorder.events.lock().take();
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PageEvent>> {
        self.events.lock().take()
    }
}

/// Prints "Server running at" and then idles until killed.
pub const SERVER_CMD: &str = "echo 'Server running at http://127.0.0.1:9/'; sleep 30";

/// Port 9 (discard) so the stale-port cleanup never touches a real service.
pub const SERVER_URL: &str = "http://127.0.0.1:9";
