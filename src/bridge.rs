//! Stdio to SSE bridge.
//!
//! Lets a client that only speaks newline-delimited JSON-RPC on stdio talk to
//! the gateway. One long-lived `GET /sse` carries responses back; each stdin
//! line becomes a `POST /message?sessionId=..`. Lines read before the session
//! id is known are queued and flushed in order once it arrives.

use std::pin::pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

/// Default gateway base URL.
pub const DEFAULT_URL: &str = "http://localhost:3000";

/// Default trace log location. Stdout belongs to the protocol.
pub const DEFAULT_LOG_FILE: &str = "/tmp/fileagent_debug.log";

const SESSION_MARKER: &str = "sessionId=";

/// Where the bridge connects and how it authenticates.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Gateway base URL, without a trailing path.
    pub base_url: String,
    /// API key; empty sends no credentials.
    pub api_key: String,
}

impl BridgeConfig {
    /// Create a config.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Stream endpoint URL.
    pub fn sse_url(&self) -> String {
        format!("{}/sse", self.base_url.trim_end_matches('/'))
    }

    /// Message endpoint URL for a session.
    pub fn message_url(&self, session_id: &str) -> String {
        format!(
            "{}/message?sessionId={}",
            self.base_url.trim_end_matches('/'),
            session_id
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            request
        } else {
            request.bearer_auth(&self.api_key)
        }
    }
}

/// Find the token following `sessionId=` in a chunk of stream text.
pub fn find_session_id(text: &str) -> Option<&str> {
    let start = text.find(SESSION_MARKER)? + SESSION_MARKER.len();
    let rest = &text[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

/// Splits a byte stream into lines, holding back a trailing partial line.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
}

impl EventStreamDecoder {
    /// Feed a chunk and return every line it completed, without terminators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }
}

/// Payload of a `data:` line if it is a JSON document. Keep-alives, event
/// names and the endpoint URL yield `None`.
pub fn json_payload(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    serde_json::from_str::<serde::de::IgnoredAny>(data).ok()?;
    Some(data)
}

/// Delivers one outbound message for a session.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Send `message` to the gateway under `session_id`.
    async fn send(&self, session_id: &str, message: String) -> Result<()>;
}

/// Posts messages to the gateway's message endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    config: BridgeConfig,
}

impl HttpSink {
    /// Create a sink sharing `client`.
    pub fn new(client: reqwest::Client, config: BridgeConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl MessageSink for HttpSink {
    async fn send(&self, session_id: &str, message: String) -> Result<()> {
        let request = self
            .client
            .post(self.config.message_url(session_id))
            .header(CONTENT_TYPE, "application/json")
            .body(message);
        self.config
            .authorize(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Read stdin-style lines into the outbound queue until EOF.
pub async fn read_lines<R>(reader: R, outbound: mpsc::UnboundedSender<String>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if outbound.send(line).is_err() {
            break;
        }
    }
    tracing::info!("Input closed");
    Ok(())
}

/// Wait for the session id, then drain the outbound queue through `sink`
/// oldest first. Send failures are logged and do not stop the bridge.
pub async fn forward_outbound<S>(
    session: oneshot::Receiver<String>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    sink: &S,
) -> Result<()>
where
    S: MessageSink + ?Sized,
{
    let session_id = session
        .await
        .map_err(|_| Error::Internal("event stream ended before a session id arrived".into()))?;

    let buffered = outbound.len();
    if buffered > 0 {
        tracing::info!(count = buffered, "Flushing buffered messages");
    }

    while let Some(message) = outbound.recv().await {
        if let Err(e) = sink.send(&session_id, message).await {
            tracing::warn!("Bridge POST error: {}", e);
        }
    }
    Ok(())
}

/// Copy JSON payloads from the event stream to `writer`, one per line, and
/// fire `session` with the first session id seen.
pub async fn relay_inbound<St, B, E, W>(
    stream: St,
    writer: &mut W,
    session: oneshot::Sender<String>,
) -> Result<()>
where
    St: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<Error>,
    W: AsyncWrite + Unpin,
{
    let mut stream = pin!(stream);
    let mut decoder = EventStreamDecoder::default();
    let mut session = Some(session);

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return Err(e.into()),
        };
        for line in decoder.push(chunk.as_ref()) {
            if session.is_some() {
                if let Some(id) = find_session_id(&line) {
                    tracing::info!("Connected with Session ID: {}", id);
                    if let Some(tx) = session.take() {
                        let _ = tx.send(id.to_string());
                    }
                }
            }

            if let Some(payload) = json_payload(&line) {
                let mut out = String::with_capacity(payload.len() + 1);
                out.push_str(payload);
                out.push('\n');
                writer.write_all(out.as_bytes()).await?;
                writer.flush().await?;
            }
        }
    }

    tracing::info!("Event stream closed");
    Ok(())
}

/// Run the bridge on the process's stdin and stdout until the event stream
/// ends. Failing to open the stream is fatal.
pub async fn run_bridge(config: BridgeConfig) -> Result<()> {
    tracing::info!(url = %config.sse_url(), "Bridge started");

    let client = reqwest::Client::new();
    let request = client
        .get(config.sse_url())
        .header(ACCEPT, "text/event-stream");
    let response = config.authorize(request).send().await?;
    tracing::info!(status = %response.status(), "SSE request status");
    let response = response.error_for_status()?;

    let (session_tx, session_rx) = oneshot::channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    // Stdin EOF stops reading but keeps the bridge alive for late responses.
    tokio::spawn(async move {
        if let Err(e) = read_lines(BufReader::new(tokio::io::stdin()), outbound_tx).await {
            tracing::warn!("Failed to read input: {}", e);
        }
    });

    let sink = HttpSink::new(client, config);
    let forward = tokio::spawn(async move {
        if let Err(e) = forward_outbound(session_rx, outbound_rx, &sink).await {
            tracing::warn!("{}", e);
        }
    });

    let mut stdout = tokio::io::stdout();
    let result = relay_inbound(response.bytes_stream(), &mut stdout, session_tx).await;
    forward.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, String)>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send(&self, session_id: &str, message: String) -> Result<()> {
            if self.fail_on == Some(message.as_str()) {
                return Err(Error::Internal("connection refused".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((session_id.to_string(), message));
            Ok(())
        }
    }

    #[test]
    fn test_find_session_id() {
        assert_eq!(
            find_session_id("data: /message?sessionId=3f2a-bc01\n"),
            Some("3f2a-bc01")
        );
        assert_eq!(find_session_id("sessionId=abc&x=1"), Some("abc"));
        assert_eq!(find_session_id("data: {}"), None);
        assert_eq!(find_session_id("sessionId="), None);
    }

    #[test]
    fn test_decoder_holds_partial_lines() {
        let mut decoder = EventStreamDecoder::default();
        assert!(decoder.push(b"event: mess").is_empty());
        assert_eq!(decoder.push(b"age\r\ndata: {}\n"), vec!["event: message", "data: {}"]);
        assert!(decoder.push(b"").is_empty());
    }

    #[test]
    fn test_json_payload_filter() {
        assert_eq!(json_payload(r#"data: {"id":1}"#), Some(r#"{"id":1}"#));
        assert_eq!(json_payload("data: /message?sessionId=abc"), None);
        assert_eq!(json_payload("data: [DONE]"), None);
        assert_eq!(json_payload(": keep-alive"), None);
        assert_eq!(json_payload("event: message"), None);
    }

    #[tokio::test]
    async fn test_buffered_messages_flush_in_order() {
        let (session_tx, session_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        for n in 1..=3 {
            tx.send(format!(r#"{{"id":{n}}}"#)).unwrap();
        }

        let sink = RecordingSink::default();
        session_tx.send("s1".to_string()).unwrap();
        tx.send(r#"{"id":4}"#.to_string()).unwrap();
        drop(tx);

        forward_outbound(session_rx, rx, &sink).await.unwrap();

        let sent = sink.sent.lock().unwrap().clone();
        let bodies: Vec<_> = sent.iter().map(|(_, body)| body.as_str()).collect();
        assert_eq!(bodies, [r#"{"id":1}"#, r#"{"id":2}"#, r#"{"id":3}"#, r#"{"id":4}"#]);
        assert!(sent.iter().all(|(session, _)| session == "s1"));
    }

    #[tokio::test]
    async fn test_failed_send_is_not_fatal() {
        let (session_tx, session_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("a".to_string()).unwrap();
        tx.send("b".to_string()).unwrap();
        drop(tx);
        session_tx.send("s1".to_string()).unwrap();

        let sink = RecordingSink {
            fail_on: Some("a"),
            ..Default::default()
        };
        forward_outbound(session_rx, rx, &sink).await.unwrap();

        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_session_means_no_forwarding() {
        let (session_tx, session_rx) = oneshot::channel::<String>();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("a".to_string()).unwrap();
        drop(session_tx);

        let sink = RecordingSink::default();
        assert!(forward_outbound(session_rx, rx, &sink).await.is_err());
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_relay_writes_json_lines_and_finds_session() {
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"event: endpoint\ndata: /message?sessi".to_vec()),
            Ok(b"onId=abc-123\n\n: keep-alive\n\n".to_vec()),
            Ok(b"event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n".to_vec()),
        ];

        let mut writer = tokio_test::io::Builder::new()
            .write(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n")
            .build();
        let (session_tx, session_rx) = oneshot::channel();

        relay_inbound(futures::stream::iter(chunks), &mut writer, session_tx)
            .await
            .unwrap();

        assert_eq!(session_rx.await.unwrap(), "abc-123");
    }

    #[tokio::test]
    async fn test_read_lines_skips_blank_lines() {
        let input: &[u8] = b"{\"id\":1}\n\n{\"id\":2}\n";
        let (tx, mut rx) = mpsc::unbounded_channel();

        read_lines(input, tx).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), r#"{"id":1}"#);
        assert_eq!(rx.recv().await.unwrap(), r#"{"id":2}"#);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_urls() {
        let config = BridgeConfig::new("http://localhost:3000/", "");
        assert_eq!(config.sse_url(), "http://localhost:3000/sse");
        assert_eq!(
            config.message_url("abc"),
            "http://localhost:3000/message?sessionId=abc"
        );
    }
}
