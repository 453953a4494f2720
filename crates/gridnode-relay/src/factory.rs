//! Session factory that relays to an upstream WebDriver service.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use url::Url;

use gridnode_core::{
    Capabilities, Command, CommandResponse, CreateSessionRequest, Dialect, HttpMethod, SessionId,
};
use gridnode_node::{ActiveSession, BoxFuture, NewSessionError, NodeError, NodeResult, SessionFactory};

use crate::client::{self, endpoint};
use crate::error::{RelayError, RelayResult};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// Starts sessions by asking `service_url` for them.
pub struct RelaySessionFactory {
    service_url: Url,
    stereotype: Capabilities,
    timeout: Duration,
    healthy: Arc<AtomicBool>,
}

impl RelaySessionFactory {
    pub fn new(service_url: Url, stereotype: Capabilities) -> Self {
        Self {
            service_url,
            stereotype,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Per-request timeout for session creation and forwarded commands.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Share a health flag, typically one driven by a
    /// [`RelayHealthMonitor`](crate::health::RelayHealthMonitor).
    pub fn with_health(mut self, healthy: Arc<AtomicBool>) -> Self {
        self.healthy = healthy;
        self
    }

    pub fn health(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.healthy)
    }

    pub fn service_url(&self) -> &Url {
        &self.service_url
    }

    fn is_chromium(&self) -> bool {
        matches!(
            self.stereotype.browser_name(),
            Some("chrome") | Some("chromium") | Some("MicrosoftEdge") | Some("msedge")
        )
    }
}

impl SessionFactory for RelaySessionFactory {
    fn apply(
        &self,
        request: CreateSessionRequest,
    ) -> BoxFuture<'_, Result<Box<dyn ActiveSession>, NewSessionError>> {
        Box::pin(async move {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(NewSessionError::retry(format!(
                    "relay service {} is unavailable",
                    self.service_url
                )));
            }

            let payload = json!({
                "capabilities": {
                    "alwaysMatch": request.desired_capabilities,
                    "firstMatch": [{}],
                }
            });
            let body = serde_json::to_vec(&payload)
                .map_err(|e| NewSessionError::not_created(e.to_string()))?;

            let url = endpoint(&self.service_url, "/session");
            let response = client::send(HttpMethod::Post, &url, body, self.timeout)
                .await
                .map_err(|e| NewSessionError::retry(format!("relay request failed: {e}")))?;

            if !response.is_success() {
                let message = String::from_utf8_lossy(&response.body).into_owned();
                warn!(%url, status = response.status, "relay refused new session");
                return Err(NewSessionError::not_created(format!(
                    "relay returned {}: {message}",
                    response.status
                )));
            }

            let (id, capabilities) = parse_new_session(&response.body)
                .map_err(|e| NewSessionError::not_created(e.to_string()))?;

            let dialect = if request.downstream_dialects.contains(&Dialect::W3c)
                || request.downstream_dialects.is_empty()
            {
                Dialect::W3c
            } else {
                Dialect::Oss
            };

            info!(session_id = %id, service = %self.service_url, "relay session started");
            Ok(Box::new(RelaySession {
                id,
                service_url: self.service_url.clone(),
                capabilities,
                dialect,
                start_time: Utc::now(),
                timeout: self.timeout,
            }) as Box<dyn ActiveSession>)
        })
    }

    fn supports_cdp(&self) -> bool {
        self.is_chromium()
    }

    fn supports_bidi(&self) -> bool {
        self.is_chromium() || self.stereotype.browser_name() == Some("firefox")
    }

    fn is_available(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Pull the session id and capabilities out of a new-session response.
///
/// Accepts both `{"value":{"sessionId","capabilities"}}` and the legacy
/// `{"sessionId","value":{...}}` shape.
pub fn parse_new_session(body: &[u8]) -> RelayResult<(SessionId, Capabilities)> {
    let json: Value = serde_json::from_slice(body)?;

    let w3c = json
        .get("value")
        .and_then(|v| Some((v.get("sessionId")?.as_str()?, v.get("capabilities")?)));
    let legacy = || Some((json.get("sessionId")?.as_str()?, json.get("value")?));

    let (id, caps) = w3c
        .or_else(legacy)
        .ok_or_else(|| RelayError::Protocol("missing sessionId in new session response".into()))?;

    let caps = caps
        .as_object()
        .cloned()
        .map(Capabilities::from_map)
        .ok_or_else(|| RelayError::Protocol("capabilities are not an object".into()))?;
    Ok((SessionId::new(id), caps))
}

/// A session living on the upstream service.
pub struct RelaySession {
    id: SessionId,
    service_url: Url,
    capabilities: Capabilities,
    dialect: Dialect,
    start_time: DateTime<Utc>,
    timeout: Duration,
}

impl ActiveSession for RelaySession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn uri(&self) -> &Url {
        &self.service_url
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn downstream_dialect(&self) -> Dialect {
        self.dialect
    }

    fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    fn execute(&self, command: Command) -> BoxFuture<'_, NodeResult<CommandResponse>> {
        Box::pin(async move {
            let url = endpoint(&self.service_url, &command.path);
            let response = client::send(command.method, &url, command.body, self.timeout)
                .await
                .map_err(|e| NodeError::Command(e.to_string()))?;
            Ok(CommandResponse {
                status: response.status,
                body: response.body,
            })
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let url = endpoint(&self.service_url, &format!("/session/{}", self.id));
            match client::send(HttpMethod::Delete, &url, Vec::new(), self.timeout).await {
                Ok(response) if response.is_success() => {
                    debug!(session_id = %self.id, "relay session deleted");
                }
                Ok(response) => {
                    warn!(session_id = %self.id, status = response.status, "relay refused session delete");
                }
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "failed to delete relay session");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_w3c_response() {
        let body = br#"{"value":{"sessionId":"abc","capabilities":{"browserName":"chrome"}}}"#;
        let (id, caps) = parse_new_session(body).unwrap();
        assert_eq!(id.as_str(), "abc");
        assert_eq!(caps.browser_name(), Some("chrome"));
    }

    #[test]
    fn parses_legacy_response() {
        let body = br#"{"status":0,"sessionId":"def","value":{"browserName":"firefox"}}"#;
        let (id, caps) = parse_new_session(body).unwrap();
        assert_eq!(id.as_str(), "def");
        assert_eq!(caps.browser_name(), Some("firefox"));
    }

    #[test]
    fn rejects_response_without_session() {
        let body = br#"{"value":{"error":"session not created"}}"#;
        assert!(matches!(
            parse_new_session(body),
            Err(RelayError::Protocol(_))
        ));
        assert!(matches!(parse_new_session(b"not json"), Err(RelayError::Json(_))));
    }

    #[test]
    fn protocol_support_follows_stereotype() {
        let url = Url::parse("http://127.0.0.1:4723").unwrap();
        let chrome = RelaySessionFactory::new(url.clone(), Capabilities::new().with("browserName", "chrome"));
        assert!(chrome.supports_cdp());
        assert!(chrome.supports_bidi());

        let safari = RelaySessionFactory::new(url, Capabilities::new().with("browserName", "safari"));
        assert!(!safari.supports_cdp());
        assert!(!safari.supports_bidi());
    }

    #[tokio::test]
    async fn unhealthy_relay_refuses_with_retryable_error() {
        let factory = RelaySessionFactory::new(
            Url::parse("http://127.0.0.1:4723").unwrap(),
            Capabilities::new(),
        );
        factory.health().store(false, Ordering::SeqCst);
        assert!(!factory.is_available());

        let err = factory
            .apply(CreateSessionRequest::new(Capabilities::new()))
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable());
    }
}
