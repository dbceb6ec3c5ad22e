//! Lambda Extensions API client
//!
//! Registers the extension with the runtime and long-polls `/event/next`
//! until a `SHUTDOWN` event arrives. The first poll doubles as the
//! extension's init-complete signal to the runtime, so the pump must not
//! start before the proxy is ready to accept connections.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};

const HEADER_EXTENSION_NAME: &str = "Lambda-Extension-Name";
const HEADER_EXTENSION_ID: &str = "Lambda-Extension-Identifier";

/// Event type that terminates the pump.
pub const SHUTDOWN_EVENT: &str = "SHUTDOWN";

/// Runtime event loop as seen by the extension.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventProcessor: Send + Sync {
    /// Register with the runtime under the given extension name.
    async fn register(&mut self, name: &str) -> Result<()>;

    /// Long-poll runtime events until shutdown is received, the token is
    /// cancelled, or the runtime API fails.
    async fn process_events(&self, shutdown: CancellationToken) -> Result<()>;
}

/// Response body of `/event/next`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NextEvent {
    pub event_type: String,
    pub deadline_ms: i64,
    pub request_id: String,
    pub invoked_function_arn: String,
    pub tracing: Option<Tracing>,
}

/// Tracing context attached to a runtime event.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Tracing {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

/// HTTP client for the Lambda Extensions API.
pub struct RuntimeClient {
    base_url: String,
    http: reqwest::Client,
    extension_id: String,
}

impl RuntimeClient {
    /// Build a client from the `AWS_LAMBDA_RUNTIME_API` environment variable.
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("AWS_LAMBDA_RUNTIME_API")
            .map_err(|_| Error::config("AWS_LAMBDA_RUNTIME_API is not set"))?;
        Ok(Self::with_base_url(format!(
            "http://{host}/2020-01-01/extension"
        )))
    }

    /// Build a client against an explicit base URL.
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
            extension_id: String::new(),
        }
    }

    /// The session identifier captured during registration.
    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    /// Long-poll the next runtime event.
    async fn next(&self) -> Result<NextEvent> {
        let url = format!("{}/event/next", self.base_url);
        let res = self
            .http
            .get(&url)
            .header(HEADER_EXTENSION_ID, &self.extension_id)
            .send()
            .await?;

        if res.status() != reqwest::StatusCode::OK {
            return Err(Error::runtime_api(format!(
                "event request failed with status {}",
                res.status()
            )));
        }

        Ok(res.json().await?)
    }
}

#[async_trait]
impl EventProcessor for RuntimeClient {
    async fn register(&mut self, name: &str) -> Result<()> {
        let url = format!("{}/register", self.base_url);
        let res = self
            .http
            .post(&url)
            .header(HEADER_EXTENSION_NAME, name)
            .json(&json!({ "events": [SHUTDOWN_EVENT] }))
            .send()
            .await?;

        if res.status() != reqwest::StatusCode::OK {
            return Err(Error::runtime_api(format!(
                "extension registration failed with status {}",
                res.status()
            )));
        }

        self.extension_id = res
            .headers()
            .get(HEADER_EXTENSION_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        debug!(extension_id = %self.extension_id, "registered with runtime");
        Ok(())
    }

    async fn process_events(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                next = self.next() => {
                    let event = next?;
                    if event.event_type == SHUTDOWN_EVENT {
                        info!("received shutdown event");
                        return Ok(());
                    }
                    // Any other event is acknowledged implicitly by polling
                    // again.
                    debug!(
                        event_type = %event.event_type,
                        request_id = %event.request_id,
                        "runtime event"
                    );
                }
            }
        }
    }
}
