use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{ACCEPT, IF_NONE_MATCH};
use reqwest::StatusCode;
use url::Url;

use crate::client::errors::TransportError;
use crate::flags::flag_models::FlagsResponse;
use crate::sse::types::{StreamEvent, StreamEventKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The server's fingerprint matches the one sent.
    Unchanged,
    Changed(FlagsResponse),
}

/// Server events in arrival order. Server `error` events arrive as
/// `Err(TransportError::Server { .. })`; the stream ending is `Err(StreamClosed)`.
pub type EventStream = BoxStream<'static, Result<StreamEvent, TransportError>>;

/// The client's view of the flag service, bound to one (user, organization) pair.
#[async_trait]
pub trait FlagTransport: Send + Sync + 'static {
    /// Conditional when `fingerprint` is given, unconditional otherwise.
    async fn fetch(&self, fingerprint: Option<&str>) -> Result<FetchOutcome, TransportError>;

    async fn subscribe(&self) -> Result<EventStream, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    flags_url: Url,
    stream_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str, user_id: &str, org_id: &str) -> Result<Self, TransportError> {
        Self::with_client(reqwest::Client::new(), base_url, user_id, org_id)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        user_id: &str,
        org_id: &str,
    ) -> Result<Self, TransportError> {
        let base = Url::parse(base_url)
            .map_err(|e| TransportError::Request(format!("invalid base url: {e}")))?;

        let endpoint = |path: &str| -> Result<Url, TransportError> {
            let mut url = base
                .join(path)
                .map_err(|e| TransportError::Request(format!("invalid url: {e}")))?;
            url.query_pairs_mut()
                .append_pair("user_id", user_id)
                .append_pair("org_id", org_id);
            Ok(url)
        };

        Ok(Self {
            flags_url: endpoint("flags")?,
            stream_url: endpoint("flags/stream")?,
            client,
        })
    }
}

#[async_trait]
impl FlagTransport for HttpTransport {
    async fn fetch(&self, fingerprint: Option<&str>) -> Result<FetchOutcome, TransportError> {
        let mut request = self.client.get(self.flags_url.clone());
        if let Some(fingerprint) = fingerprint {
            request = request.header(IF_NONE_MATCH, format!("\"{fingerprint}\""));
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(FetchOutcome::Unchanged),
            status if status.is_success() => {
                Ok(FetchOutcome::Changed(response.json::<FlagsResponse>().await?))
            }
            status => Err(TransportError::Status(status.as_u16())),
        }
    }

    async fn subscribe(&self) -> Result<EventStream, TransportError> {
        let response = self
            .client
            .get(self.stream_url.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        let mut body = Box::pin(response.bytes_stream());
        let events = async_stream::stream! {
            let mut decoder = SseDecoder::default();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(TransportError::from(e));
                        return;
                    }
                };
                for frame in decoder.push(&chunk) {
                    if let Some(event) = frame.into_event() {
                        yield event;
                    }
                }
            }
            yield Err(TransportError::StreamClosed);
        };

        Ok(events.boxed())
    }
}

/// One dispatched Server-Sent Event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub retry_ms: Option<u64>,
}

impl SseFrame {
    /// Decodes the frame's JSON payload. Frames without data (keep-alives) yield nothing.
    fn into_event(self) -> Option<Result<StreamEvent, TransportError>> {
        if self.data.is_empty() {
            return None;
        }
        let event = match serde_json::from_str::<StreamEvent>(&self.data) {
            Ok(event) => event,
            Err(e) => return Some(Err(e.into())),
        };
        if event.kind == StreamEventKind::Error {
            return Some(Err(TransportError::Server {
                retry_after: event.retry_after(),
            }));
        }
        Some(Ok(event))
    }
}

/// Incremental `text/event-stream` parser. Bytes may be split anywhere, including inside a
/// UTF-8 sequence or between `\r` and `\n`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    current: SseFrame,
    has_data: bool,
}

impl SseDecoder {
    /// Feeds bytes and returns every frame they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(frame) = self.process_line(&String::from_utf8_lossy(&line)) {
                frames.push(frame);
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if !self.has_data && self.current.event.is_none() {
                self.current = SseFrame::default();
                return None;
            }
            self.has_data = false;
            return Some(std::mem::take(&mut self.current));
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.current.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
            }
            "retry" => self.current.retry_ms = value.trim().parse().ok(),
            _ => {}
        }
        None
    }
}
