//! Headless browser capability
//!
//! Used only as the last extraction stage, for embed pages that assemble the
//! stream URL in client-side script. The pipeline depends on the
//! [`BrowserAutomation`] trait; [`WebDriverBrowser`] implements it against
//! any W3C WebDriver endpoint (chromedriver, geckodriver, selenium).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BrowserConfig;
use crate::errors::BrowserError;

/// One browser tab
#[async_trait]
pub trait BrowserPage: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;

    /// Poll the JavaScript expression until it is truthy or `timeout` elapses
    async fn wait_for(&mut self, condition: &str, timeout: Duration) -> Result<(), BrowserError>;

    /// Evaluate a JavaScript expression and return its JSON value
    async fn evaluate(&mut self, script: &str) -> Result<Value, BrowserError>;

    async fn close(&mut self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserAutomation: Send + Sync {
    async fn open_page(&self) -> Result<Box<dyn BrowserPage>, BrowserError>;
}

/// JavaScript truthiness of a JSON value
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// W3C WebDriver client
#[derive(Clone)]
pub struct WebDriverBrowser {
    client: Client,
    endpoint: String,
    capabilities: Value,
    poll_interval: Duration,
}

impl WebDriverBrowser {
    pub fn new(endpoint: &str, config: &BrowserConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            capabilities: capabilities_for(config),
            poll_interval: config.poll_interval,
        })
    }

    /// Build from configuration; `None` when no WebDriver endpoint is set
    pub fn from_config(config: &BrowserConfig) -> Result<Option<Self>, reqwest::Error> {
        config
            .webdriver_url
            .as_deref()
            .map(|endpoint| Self::new(endpoint, config))
            .transpose()
    }
}

fn capabilities_for(config: &BrowserConfig) -> Value {
    let mut args: Vec<String> = Vec::new();
    let browser = config.browser_name.to_ascii_lowercase();
    if config.headless {
        if browser == "firefox" {
            args.push("-headless".to_string());
        } else {
            args.extend(
                ["--headless=new", "--no-sandbox", "--disable-gpu", "--disable-dev-shm-usage"]
                    .iter()
                    .map(|a| a.to_string()),
            );
        }
    }
    args.extend(config.extra_args.iter().cloned());

    let options_key = if browser == "firefox" {
        "moz:firefoxOptions"
    } else {
        "goog:chromeOptions"
    };
    let mut always_match = serde_json::Map::new();
    always_match.insert("browserName".to_string(), json!(config.browser_name));
    always_match.insert("pageLoadStrategy".to_string(), json!("normal"));
    always_match.insert(options_key.to_string(), json!({ "args": args }));

    json!({ "capabilities": { "alwaysMatch": always_match } })
}

async fn command(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, BrowserError> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await.map_err(|e| {
        if e.is_connect() {
            BrowserError::Unavailable {
                message: e.to_string(),
            }
        } else {
            BrowserError::Protocol {
                message: e.to_string(),
            }
        }
    })?;
    let status = response.status();
    let payload: Value = response.json().await.map_err(|e| BrowserError::Protocol {
        message: format!("invalid WebDriver response: {e}"),
    })?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    if !status.is_success() {
        let error = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        let message = value.get("message").and_then(Value::as_str).unwrap_or("");
        return Err(if error == "javascript error" {
            BrowserError::Script {
                message: message.to_string(),
            }
        } else {
            BrowserError::Protocol {
                message: format!("{error}: {message}"),
            }
        });
    }
    Ok(value)
}

#[async_trait]
impl BrowserAutomation for WebDriverBrowser {
    async fn open_page(&self) -> Result<Box<dyn BrowserPage>, BrowserError> {
        let value = command(
            &self.client,
            Method::POST,
            &format!("{}/session", self.endpoint),
            Some(self.capabilities.clone()),
        )
        .await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Protocol {
                message: "new session response has no sessionId".to_string(),
            })?
            .to_string();
        debug!("Opened WebDriver session {}", session_id);

        Ok(Box::new(WebDriverPage {
            client: self.client.clone(),
            session_url: format!("{}/session/{}", self.endpoint, session_id),
            poll_interval: self.poll_interval,
            closed: false,
        }))
    }
}

struct WebDriverPage {
    client: Client,
    session_url: String,
    poll_interval: Duration,
    closed: bool,
}

#[async_trait]
impl BrowserPage for WebDriverPage {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        command(
            &self.client,
            Method::POST,
            &format!("{}/url", self.session_url),
            Some(json!({ "url": url })),
        )
        .await
        .map(|_| ())
    }

    async fn wait_for(&mut self, condition: &str, timeout: Duration) -> Result<(), BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.evaluate(condition).await {
                Ok(value) if is_truthy(&value) => return Ok(()),
                Ok(_) => {}
                // Scripts fail transiently while the page is still loading
                Err(BrowserError::Script { message }) => {
                    debug!("Wait condition not evaluable yet: {}", message)
                }
                Err(e) => return Err(e),
            }
            if Instant::now() + self.poll_interval >= deadline {
                return Err(BrowserError::Timeout { timeout });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn evaluate(&mut self, script: &str) -> Result<Value, BrowserError> {
        command(
            &self.client,
            Method::POST,
            &format!("{}/execute/sync", self.session_url),
            Some(json!({ "script": format!("return ({script});"), "args": [] })),
        )
        .await
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        command(&self.client, Method::DELETE, &self.session_url, None)
            .await
            .map(|_| ())
    }
}

impl Drop for WebDriverPage {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Best effort: never leave a browser session running upstream
        warn!("WebDriver session dropped without close, deleting in background");
        let client = self.client.clone();
        let session_url = self.session_url.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = client.delete(session_url).send().await;
            });
        }
    }
}
