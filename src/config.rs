//! Playground configuration
//!
//! Values come from defaults, chained setters, or the environment
//! (`PLAYGROUND_*` variables) for deployments that inject them.

use std::time::Duration;

use crate::error::{Error, Result};

const DEFAULT_API_URL: &str = "http://localhost:8080/api";
const DEFAULT_SOCKET_URL: &str = "ws://localhost:8080/live";

/// Configuration shared by the gateway, the controller and the live channel
#[derive(Debug, Clone)]
pub struct PlaygroundConfig {
    /// REST base URL, without trailing slash
    pub api_url: String,
    /// WebSocket URL of the live update service
    pub socket_url: String,
    /// Timeout applied to every REST call
    pub request_timeout: Duration,
    /// How long clicks stay swallowed after the last drag event
    pub drag_cooldown: Duration,
    /// First reconnect delay for the live channel
    pub reconnect_initial_delay: Duration,
    /// Upper bound for the reconnect backoff
    pub reconnect_max_delay: Duration,
    /// Directory served under `/static` by the canvas host
    pub static_dir: String,
    /// Page title of the canvas host
    pub title: String,
}

impl Default for PlaygroundConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            request_timeout: Duration::from_secs(15),
            drag_cooldown: Duration::from_millis(1000),
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(10),
            static_dir: "static".to_string(),
            title: "Playground".to_string(),
        }
    }
}

impl PlaygroundConfig {
    /// Creates a configuration pointing at the given REST base URL
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::default().api_url(api_url)
    }

    /// Loads overrides from the environment on top of the defaults.
    ///
    /// Recognised variables: `PLAYGROUND_API_URL`, `PLAYGROUND_SOCKET_URL`,
    /// `PLAYGROUND_REQUEST_TIMEOUT_MS`, `PLAYGROUND_STATIC_DIR`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("PLAYGROUND_API_URL")
            && !url.is_empty()
        {
            config = config.api_url(url);
        }
        if let Ok(url) = std::env::var("PLAYGROUND_SOCKET_URL")
            && !url.is_empty()
        {
            config.socket_url = url;
        }
        if let Ok(ms) = std::env::var("PLAYGROUND_REQUEST_TIMEOUT_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                Error::Config(format!("PLAYGROUND_REQUEST_TIMEOUT_MS is not a number: {ms}"))
            })?;
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Ok(dir) = std::env::var("PLAYGROUND_STATIC_DIR")
            && !dir.is_empty()
        {
            config.static_dir = dir;
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets the REST base URL
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Sets the live channel URL
    pub fn socket_url(mut self, url: impl Into<String>) -> Self {
        self.socket_url = url.into();
        self
    }

    /// Sets the REST timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the post-drag click lock window
    pub fn drag_cooldown(mut self, cooldown: Duration) -> Self {
        self.drag_cooldown = cooldown;
        self
    }

    /// Sets the reconnect backoff bounds
    pub fn reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial_delay = initial;
        self.reconnect_max_delay = max.max(initial);
        self
    }

    /// Sets the static files directory
    pub fn static_dir(mut self, dir: impl Into<String>) -> Self {
        self.static_dir = dir.into();
        self
    }

    /// Sets the page title
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Checks URL schemes
    pub fn validate(&self) -> Result<()> {
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err(Error::Config(format!(
                "api_url must start with http:// or https://, got: {}",
                self.api_url
            )));
        }
        if !self.socket_url.starts_with("ws://") && !self.socket_url.starts_with("wss://") {
            return Err(Error::Config(format!(
                "socket_url must start with ws:// or wss://, got: {}",
                self.socket_url
            )));
        }
        Ok(())
    }
}
