use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::TransportSection;
use crate::evaluator::TEMPLATE_BELOW;

const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("notification endpoint answered with status {status}")]
    Status { status: u16 },
    #[error("notification rejected: {0}")]
    Rejected(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Delivers a rendered alert (mail, chat, webhook, ...).
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, template_id: &str, context: &Map<String, Value>) -> TransportResult<()>;

    fn name(&self) -> &str;
}

/// Builds the transport described by the `[transport]` config section.
pub fn transport_from_section(
    section: &TransportSection,
) -> TransportResult<Box<dyn NotificationTransport>> {
    match section {
        TransportSection::Log => Ok(Box::new(LogTransport::new("log"))),
        TransportSection::Webhook {
            url,
            timeout_seconds,
        } => {
            let timeout = timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_WEBHOOK_TIMEOUT);
            Ok(Box::new(WebhookTransport::new(url.clone(), timeout)?))
        }
    }
}

#[derive(Debug)]
pub struct LogTransport {
    name: String,
}

impl LogTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn send(&self, template_id: &str, context: &Map<String, Value>) -> TransportResult<()> {
        let queue = context.get("queue").and_then(Value::as_str).unwrap_or("?");
        let size = context.get("size").cloned().unwrap_or(Value::Null);
        let threshold = context.get("threshold").cloned().unwrap_or(Value::Null);
        let sending_number = context.get("sendingNumber").cloned().unwrap_or(Value::Null);
        if template_id == TEMPLATE_BELOW {
            tracing::info!(
                target: "alerts",
                template = template_id,
                queue,
                %size,
                %threshold,
                "queue back under threshold"
            );
        } else {
            tracing::warn!(
                target: "alerts",
                template = template_id,
                queue,
                %size,
                %threshold,
                %sending_number,
                "queue above threshold"
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    template: &'a str,
    context: &'a Map<String, Value>,
}

/// Posts `{"template": ..., "context": {...}}` as JSON; any non-2xx answer
/// counts as a failed delivery.
#[derive(Debug, Clone)]
pub struct WebhookTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> TransportResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl NotificationTransport for WebhookTransport {
    async fn send(&self, template_id: &str, context: &Map<String, Value>) -> TransportResult<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&WebhookPayload {
                template: template_id,
                context,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentNotification {
    pub template_id: String,
    pub context: Map<String, Value>,
}

impl SentNotification {
    pub fn queue(&self) -> Option<&str> {
        self.context.get("queue").and_then(Value::as_str)
    }

    pub fn sending_number(&self) -> Option<u64> {
        self.context.get("sendingNumber").and_then(Value::as_u64)
    }
}

/// Keeps every notification in memory. Sends for queues marked with
/// [`Self::reject_queue`] fail instead.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentNotification>>,
    rejected_queues: Mutex<BTreeSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reject_queue(&self, queue: impl Into<String>) {
        self.rejected_queues.lock().await.insert(queue.into());
    }

    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }

    pub async fn take(&self) -> Vec<SentNotification> {
        std::mem::take(&mut *self.sent.lock().await)
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn send(&self, template_id: &str, context: &Map<String, Value>) -> TransportResult<()> {
        let queue = context.get("queue").and_then(Value::as_str).unwrap_or_default();
        if self.rejected_queues.lock().await.contains(queue) {
            return Err(TransportError::Rejected(format!("queue {queue} is rejected")));
        }
        self.sent.lock().await.push(SentNotification {
            template_id: template_id.to_string(),
            context: context.clone(),
        });
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn context(queue: &str) -> Map<String, Value> {
        match json!({ "queue": queue, "size": 10, "threshold": 5, "sendingNumber": 1 }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn recording_transport_keeps_order_and_rejects() {
        let transport = RecordingTransport::new();
        transport.reject_queue("broken").await;

        transport.send("t/above", &context("a")).await.unwrap();
        assert!(matches!(
            transport.send("t/above", &context("broken")).await.unwrap_err(),
            TransportError::Rejected(_)
        ));
        transport.send("t/below", &context("b")).await.unwrap();

        let sent = transport.take().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].queue(), Some("a"));
        assert_eq!(sent[1].template_id, "t/below");
        assert_eq!(sent[0].sending_number(), Some(1));
        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn log_transport_never_fails() {
        let transport = LogTransport::new("log");
        transport
            .send(crate::evaluator::TEMPLATE_ABOVE, &context("a"))
            .await
            .unwrap();
        transport.send(TEMPLATE_BELOW, &Map::new()).await.unwrap();
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(head_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..head_end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= head_end + 4 + length
    }

    /// Serves one request with `status_line` and hands back what was received.
    async fn answer_once(status_line: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/hook", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request_complete(&request) {
                let read = socket.read(&mut buf).await.unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..read]);
            }
            let response =
                format!("{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
        });
        (endpoint, rx)
    }

    #[tokio::test]
    async fn webhook_posts_template_and_context() {
        let (endpoint, received) = answer_once("HTTP/1.1 200 OK").await;
        let transport = WebhookTransport::new(endpoint, Duration::from_secs(5)).unwrap();

        transport
            .send(crate::evaluator::TEMPLATE_ABOVE, &context("orders"))
            .await
            .unwrap();

        let request = received.await.unwrap();
        assert!(request.starts_with("POST /hook "));
        assert!(request.contains(r#""template":"monitoring/queue-threshold-alert/above""#));
        assert!(request.contains(r#""queue":"orders""#));
    }

    #[tokio::test]
    async fn webhook_error_status_is_a_failed_delivery() {
        let (endpoint, _received) = answer_once("HTTP/1.1 500 Internal Server Error").await;
        let transport = WebhookTransport::new(endpoint, Duration::from_secs(5)).unwrap();

        let err = transport
            .send(TEMPLATE_BELOW, &context("orders"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 500 }));
    }

    #[test]
    fn builds_transport_from_section() {
        let transport = transport_from_section(&TransportSection::Log).unwrap();
        assert_eq!(transport.name(), "log");

        let transport = transport_from_section(&TransportSection::Webhook {
            url: "http://127.0.0.1:9/hook".to_string(),
            timeout_seconds: Some(1),
        })
        .unwrap();
        assert_eq!(transport.name(), "webhook");
    }
}
