//! Server-sent-events decoding for streaming completions.
//!
//! Both vendors stream `data: {json}` lines. Bytes are buffered until a full
//! line is available, so multi-byte characters split across network chunks
//! decode correctly. The whole body is never time-capped; instead each gap
//! between chunks is bounded by an idle timeout.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tracing::debug;

use super::llm::{BackendError, TextStream};

/// HTTP client for streaming calls. Only connecting is time-bounded here,
/// since a total-request timeout would cut off long streams.
pub fn streaming_client(connect_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .unwrap_or_default()
}

type ByteStream = BoxStream<'static, Result<Bytes, String>>;

/// Pulls the text delta out of one decoded event.
pub type DeltaExtractor = fn(&Value) -> Option<String>;

#[derive(Debug, Clone, PartialEq)]
pub enum SseItem {
    Data(Value),
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the events completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        self.buffer.extend_from_slice(chunk);
        let mut items = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(item) = decode_line(&String::from_utf8_lossy(&line)) {
                items.push(item);
            }
        }
        items
    }

    /// Decode whatever is left once the body ends without a final newline.
    pub fn finish(&mut self) -> Option<SseItem> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&String::from_utf8_lossy(&rest))
    }
}

fn decode_line(line: &str) -> Option<SseItem> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseItem::Done);
    }
    match serde_json::from_str(data) {
        Ok(value) => Some(SseItem::Data(value)),
        Err(e) => {
            debug!("skipping undecodable SSE line: {e}");
            None
        }
    }
}

fn event_error(value: &Value) -> Option<String> {
    let error = value.get("error")?;
    Some(
        error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
    )
}

struct StreamState {
    body: ByteStream,
    decoder: SseDecoder,
    pending: VecDeque<Result<String, BackendError>>,
    done: bool,
}

impl StreamState {
    fn accept(&mut self, items: Vec<SseItem>, extract: DeltaExtractor) {
        for item in items {
            if self.done {
                return;
            }
            match item {
                SseItem::Done => self.done = true,
                SseItem::Data(value) => {
                    if let Some(message) = event_error(&value) {
                        self.pending.push_back(Err(BackendError::Request(message)));
                        self.done = true;
                    } else if let Some(text) = extract(&value).filter(|t| !t.is_empty()) {
                        self.pending.push_back(Ok(text));
                    }
                }
            }
        }
    }
}

/// Turn a streaming HTTP response into text fragments. Fails with
/// [`BackendError::Timeout`] when no bytes arrive for `idle`.
pub fn text_stream(response: reqwest::Response, extract: DeltaExtractor, idle: Duration) -> TextStream {
    let body = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| e.to_string()))
        .boxed();
    decode_body(body, extract, idle)
}

fn decode_body(body: ByteStream, extract: DeltaExtractor, idle: Duration) -> TextStream {
    let state = StreamState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            let next = match tokio::time::timeout(idle, state.body.next()).await {
                Ok(next) => next,
                Err(_) => {
                    state.pending.push_back(Err(BackendError::Timeout(idle)));
                    state.done = true;
                    continue;
                }
            };
            match next {
                Some(Ok(chunk)) => {
                    let items = state.decoder.push(&chunk);
                    state.accept(items, extract);
                }
                Some(Err(e)) => {
                    state.pending.push_back(Err(BackendError::Request(e)));
                    state.done = true;
                }
                None => {
                    let rest = state.decoder.finish().into_iter().collect();
                    state.accept(rest, extract);
                    state.done = true;
                }
            }
        }
    })
    .boxed()
}
