//! Browser capability consumed by the state machine
//!
//! Only what the orchestrator needs: launch, one page per test file, a handful
//! of interactions for declarative steps, and a stream of console and
//! uncaught-error events.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::E2eResult;
use crate::logs::LogSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleKind {
    Log,
    Debug,
    Info,
    Error,
    Warning,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLocation {
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "lineNumber")]
    pub line_number: u32,
    #[serde(default, rename = "columnNumber")]
    pub column_number: u32,
}

/// Event emitted by an open page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PageEvent {
    Console {
        kind: ConsoleKind,
        text: String,
        #[serde(default)]
        location: ConsoleLocation,
    },
    /// Uncaught exception in the page
    PageError {
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
}

impl PageEvent {
    pub fn log_source(&self) -> LogSource {
        match self {
            PageEvent::Console {
                kind: ConsoleKind::Error,
                ..
            } => LogSource::BrowserError,
            PageEvent::Console {
                kind: ConsoleKind::Warning,
                ..
            } => LogSource::BrowserWarning,
            PageEvent::Console { .. } => LogSource::BrowserLog,
            PageEvent::PageError { .. } => LogSource::BrowserError,
        }
    }

    /// Text recorded in the log store.
    pub fn render(&self) -> String {
        match self {
            PageEvent::Console { text, location, .. } => {
                if location.url.is_empty() {
                    return text.clone();
                }
                let rendered = serde_json::json!({
                    "text": text,
                    "location": location,
                });
                serde_json::to_string_pretty(&rendered).unwrap_or_else(|_| text.clone())
            }
            PageEvent::PageError { message, stack } => match stack {
                Some(stack) if stack.contains(message.as_str()) => stack.clone(),
                Some(stack) => format!("{}\n{}", message, stack),
                None => message.clone(),
            },
        }
    }
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self) -> E2eResult<Box<dyn Browser>>;
}

#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_page(&self) -> E2eResult<Box<dyn BrowserPage>>;
    async fn close(&self) -> E2eResult<()>;
}

#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn goto(&self, url: &str) -> E2eResult<()>;
    async fn click(&self, selector: &str) -> E2eResult<()>;
    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()>;
    async fn press(&self, key: &str) -> E2eResult<()>;
    async fn wait_for_selector(&self, selector: &str) -> E2eResult<()>;
    async fn text_content(&self, selector: &str) -> E2eResult<Option<String>>;
    async fn set_default_timeout(&self, timeout: Duration) -> E2eResult<()>;
    async fn close(&self) -> E2eResult<()>;

    /// Console/error listener. Yields `None` the second time; the stream ends
    /// when the page closes.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PageEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_kinds_map_to_sources() {
        let event = |kind| PageEvent::Console {
            kind,
            text: "x".into(),
            location: ConsoleLocation::default(),
        };
        assert_eq!(event(ConsoleKind::Error).log_source(), LogSource::BrowserError);
        assert_eq!(event(ConsoleKind::Warning).log_source(), LogSource::BrowserWarning);
        assert_eq!(event(ConsoleKind::Info).log_source(), LogSource::BrowserLog);
        let page_error = PageEvent::PageError {
            message: "boom".into(),
            stack: None,
        };
        assert_eq!(page_error.log_source(), LogSource::BrowserError);
    }

    #[test]
    fn parses_bridge_events() {
        let event: PageEvent = serde_json::from_str(
            r#"{"event":"console","kind":"timeEnd","text":"t: 3ms","location":{"url":"http://localhost:3000/","lineNumber":4,"columnNumber":2}}"#,
        )
        .unwrap();
        assert_eq!(event.log_source(), LogSource::BrowserLog);
        assert!(event.render().contains("\"lineNumber\": 4"));
    }

    #[test]
    fn page_error_render_avoids_duplicate_message() {
        let event = PageEvent::PageError {
            message: "Error: boom".into(),
            stack: Some("Error: boom\n    at main.js:1:1".into()),
        };
        assert_eq!(event.render(), "Error: boom\n    at main.js:1:1");
    }
}
