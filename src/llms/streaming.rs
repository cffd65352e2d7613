//! Streaming completion support.
//!
//! Providers push server-sent events through an [`SseDecoder`], translate
//! each frame into [`StreamChunk`] values, and hand the raw text deltas to a
//! [`SurfaceGate`]. Only the gate's output (user-visible `surface_response`
//! text, released once the `control_packet` is complete) reaches the caller
//! through [`CompletionStream`].
//!
//! The body reader runs in its own task. On cancellation the driving task
//! tells the reader to drop the response (which closes the connection) and
//! waits for it to exit before reporting `Cancelled`.

use bytes::BytesMut;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{PerceptionError, Result};

/// Capacity of the surface chunk channel.
pub const CHUNK_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// StreamChunk
// ---------------------------------------------------------------------------

/// One decoded event from a provider stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// A fragment of the completion text.
    TextDelta { text: String },
    /// A fragment of model reasoning; never shown to the user.
    ThinkingDelta { text: String },
    /// A usage block reported by the provider.
    Usage { usage: Value },
    /// The provider signalled the end of the stream.
    Done,
    /// The provider reported an error inside the stream.
    Error { message: String },
}

/// Everything the reader collected once the stream ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    /// Full raw completion text (the envelope JSON).
    pub content: String,
    /// Concatenated reasoning, when the provider streamed any.
    pub thinking: String,
    pub usage: Option<Value>,
}

// ---------------------------------------------------------------------------
// SSE decoding
// ---------------------------------------------------------------------------

/// One server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence.
/// Events end at a blank line; multiple `data:` lines join with `\n`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every event they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buf.is_empty() {
            let rest = self.buf.split();
            let rest = String::from_utf8_lossy(&rest).into_owned();
            let line = rest.trim_end_matches(['\n', '\r']).to_string();
            if let Some(frame) = self.line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// Translates one SSE frame into chunks. `Err` marks a malformed frame,
/// which the reader logs and skips.
pub type FrameParser = fn(&SseFrame) -> std::result::Result<Vec<StreamChunk>, String>;

// ---------------------------------------------------------------------------
// Surface gate
// ---------------------------------------------------------------------------

/// Incremental filter that releases `surface_response` text only after the
/// top-level `control_packet` object has closed.
///
/// Input is the raw envelope JSON as it streams in. Leading prose or code
/// fences before the first `{` are skipped. String escapes (including
/// `\uXXXX` surrogate pairs) are decoded. When `surface_response` arrives
/// before `control_packet`, the text is held and released by
/// [`finish`](Self::finish) once the control packet has been seen.
#[derive(Debug, Default)]
pub struct SurfaceGate {
    depth: usize,
    finished_top: bool,
    in_string: bool,
    escape: bool,
    unicode: Option<String>,
    high_surrogate: Option<u32>,
    expecting_key: bool,
    capturing_key: bool,
    key: String,
    value_key: Option<String>,
    control_open: bool,
    control_done: bool,
    in_surface: bool,
    surface_done: bool,
    held: bool,
    surface: String,
    emitted: usize,
}

impl SurfaceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control_complete(&self) -> bool {
        self.control_done
    }

    /// Decoded surface text seen so far, released or not.
    pub fn surface(&self) -> &str {
        &self.surface
    }

    /// Feed raw text; returns newly releasable surface text.
    pub fn push(&mut self, text: &str) -> Option<String> {
        for c in text.chars() {
            if self.finished_top {
                break;
            }
            self.step(c);
        }
        if self.control_done && !self.held && (self.in_surface || self.surface_done) {
            self.release()
        } else {
            None
        }
    }

    /// End of stream: release anything still held when the control packet
    /// was complete.
    pub fn finish(&mut self) -> Option<String> {
        if self.control_done {
            self.release()
        } else {
            None
        }
    }

    fn release(&mut self) -> Option<String> {
        if self.emitted >= self.surface.len() {
            return None;
        }
        let out = self.surface[self.emitted..].to_string();
        self.emitted = self.surface.len();
        Some(out)
    }

    fn step(&mut self, c: char) {
        if self.in_string {
            self.string_char(c);
            return;
        }
        match c {
            '"' => {
                self.in_string = true;
                if self.depth == 1 && self.expecting_key {
                    self.capturing_key = true;
                    self.key.clear();
                } else if self.depth == 1 && self.value_key.as_deref() == Some("surface_response") {
                    self.in_surface = true;
                    self.held = !self.control_done;
                }
            }
            '{' | '[' => {
                self.depth += 1;
                if self.depth == 1 {
                    self.expecting_key = true;
                } else if self.depth == 2
                    && c == '{'
                    && self.value_key.as_deref() == Some("control_packet")
                {
                    self.control_open = true;
                }
            }
            '}' | ']' => {
                if self.depth == 0 {
                    return;
                }
                self.depth -= 1;
                if self.depth == 1 && self.control_open {
                    self.control_open = false;
                    self.control_done = true;
                }
                if self.depth == 0 {
                    self.finished_top = true;
                }
            }
            ':' if self.depth == 1 => {
                self.value_key = Some(self.key.to_lowercase());
                self.expecting_key = false;
            }
            ',' if self.depth == 1 => {
                self.expecting_key = true;
                self.value_key = None;
            }
            _ => {}
        }
    }

    fn string_char(&mut self, c: char) {
        if let Some(hex) = self.unicode.as_mut() {
            hex.push(c);
            if hex.len() == 4 {
                let code = u32::from_str_radix(hex, 16).ok();
                self.unicode = None;
                if let Some(code) = code {
                    self.unicode_scalar(code);
                }
            }
            return;
        }
        if self.escape {
            self.escape = false;
            let decoded = match c {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                'b' => '\u{8}',
                'f' => '\u{c}',
                'u' => {
                    self.unicode = Some(String::with_capacity(4));
                    return;
                }
                other => other,
            };
            self.string_content(decoded);
            return;
        }
        match c {
            '\\' => self.escape = true,
            '"' => {
                self.in_string = false;
                if self.capturing_key {
                    self.capturing_key = false;
                }
                if self.in_surface {
                    self.in_surface = false;
                    self.surface_done = true;
                    self.value_key = None;
                }
            }
            other => self.string_content(other),
        }
    }

    fn unicode_scalar(&mut self, code: u32) {
        if (0xD800..0xDC00).contains(&code) {
            self.high_surrogate = Some(code);
            return;
        }
        let scalar = match self.high_surrogate.take() {
            Some(high) if (0xDC00..0xE000).contains(&code) => {
                0x10000 + ((high - 0xD800) << 10) + (code - 0xDC00)
            }
            _ => code,
        };
        if let Some(ch) = char::from_u32(scalar) {
            self.string_content(ch);
        }
    }

    fn string_content(&mut self, c: char) {
        if self.capturing_key {
            self.key.push(c);
        } else if self.in_surface {
            self.surface.push(c);
        }
    }
}

// ---------------------------------------------------------------------------
// CompletionStream
// ---------------------------------------------------------------------------

/// A running streaming completion.
///
/// Read surface chunks with [`next_chunk`](Self::next_chunk), then call
/// [`finish`](Self::finish) for the full raw text or the terminal error.
#[derive(Debug)]
pub struct CompletionStream {
    chunks: mpsc::Receiver<String>,
    driver: JoinHandle<Result<StreamOutcome>>,
    provider: String,
}

impl CompletionStream {
    /// Next surface chunk, or `None` once the producer has closed the channel.
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.chunks.recv().await
    }

    /// Drain remaining chunks into `sink` and wait for the stream to end.
    pub async fn finish_forwarding(mut self, sink: Option<&mpsc::Sender<String>>) -> Result<StreamOutcome> {
        while let Some(chunk) = self.chunks.recv().await {
            if let Some(sink) = sink {
                // A dropped sink only stops the display; the stream continues.
                let _ = sink.send(chunk).await;
            }
        }
        self.driver
            .await
            .map_err(|e| PerceptionError::transport(&self.provider, format!("stream task failed: {}", e)))?
    }

    /// Discard remaining chunks and return the outcome.
    pub async fn finish(self) -> Result<StreamOutcome> {
        self.finish_forwarding(None).await
    }

    /// A stream already completed with `content`, for clients without
    /// native streaming. The gated surface text is delivered as one chunk.
    pub fn from_content(provider: &str, content: String) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let mut gate = SurfaceGate::new();
        let mut surface = gate.push(&content).unwrap_or_default();
        surface.push_str(&gate.finish().unwrap_or_default());
        if !surface.is_empty() {
            let _ = tx.try_send(surface);
        }
        drop(tx);
        let driver = tokio::spawn(async move {
            Ok(StreamOutcome {
                content,
                ..Default::default()
            })
        });
        Self {
            chunks: rx,
            driver,
            provider: provider.to_string(),
        }
    }
}

/// Start reading an SSE response in the background.
///
/// `parse` maps frames to chunks; `permit` (if any) is held until the
/// stream ends so the client's concurrency cap covers streaming requests.
pub fn spawn_sse_reader(
    ctx: &Context,
    provider: &str,
    request_id: &str,
    response: reqwest::Response,
    parse: FrameParser,
    permit: Option<OwnedSemaphorePermit>,
) -> CompletionStream {
    let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
    let close = CancellationToken::new();

    let reader = tokio::spawn(read_sse(
        provider.to_string(),
        request_id.to_string(),
        response,
        parse,
        tx,
        close.clone(),
    ));

    let ctx = ctx.clone();
    let driver_provider = provider.to_string();
    let request_id = request_id.to_string();
    let driver = tokio::spawn(async move {
        let _permit = permit;
        let mut reader = reader;
        tokio::select! {
            joined = &mut reader => joined.map_err(|e| {
                PerceptionError::transport(&driver_provider, format!("stream reader failed: {}", e))
            })?,
            err = ctx.done() => {
                tracing::info!(
                    request_id = %request_id,
                    provider = %driver_provider,
                    phase = "stream_cancel",
                    "closing stream body"
                );
                close.cancel();
                let _ = reader.await;
                Err(err)
            }
        }
    });

    CompletionStream {
        chunks: rx,
        driver,
        provider: provider.to_string(),
    }
}

async fn read_sse(
    provider: String,
    request_id: String,
    response: reqwest::Response,
    parse: FrameParser,
    tx: mpsc::Sender<String>,
    close: CancellationToken,
) -> Result<StreamOutcome> {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut gate = SurfaceGate::new();
    let mut outcome = StreamOutcome::default();

    let handle = |frame: SseFrame, outcome: &mut StreamOutcome, gate: &mut SurfaceGate| -> Result<Vec<String>> {
        let mut released = Vec::new();
        if frame.is_done_marker() {
            return Ok(released);
        }
        let chunks = match parse(&frame) {
            Ok(chunks) => chunks,
            Err(reason) => {
                tracing::debug!(
                    request_id = %request_id,
                    provider = %provider,
                    phase = "stream_frame_skipped",
                    reason = %reason,
                    "skipping malformed stream frame"
                );
                return Ok(released);
            }
        };
        for chunk in chunks {
            match chunk {
                StreamChunk::TextDelta { text } => {
                    outcome.content.push_str(&text);
                    if let Some(surface) = gate.push(&text) {
                        released.push(surface);
                    }
                }
                StreamChunk::ThinkingDelta { text } => outcome.thinking.push_str(&text),
                StreamChunk::Usage { usage } => outcome.usage = Some(usage),
                StreamChunk::Done => {}
                StreamChunk::Error { message } => {
                    return Err(if crate::llms::transport::contains_rate_limit_marker(&message) {
                        PerceptionError::rate_limited(&provider, None, message)
                    } else {
                        PerceptionError::transport(&provider, message)
                    });
                }
            }
        }
        Ok(released)
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = close.cancelled() => {
                return Err(PerceptionError::cancelled("stream closed"));
            }
            next = body.next() => next,
        };
        match next {
            Some(Ok(bytes)) => {
                for frame in decoder.push(&bytes) {
                    for surface in handle(frame, &mut outcome, &mut gate)? {
                        if tx.send(surface).await.is_err() {
                            log::debug!("{}: surface receiver dropped", provider);
                        }
                    }
                }
            }
            Some(Err(e)) => {
                return Err(PerceptionError::transport(&provider, format!("stream read: {}", e)));
            }
            None => break,
        }
    }

    if let Some(frame) = decoder.finish() {
        for surface in handle(frame, &mut outcome, &mut gate)? {
            let _ = tx.send(surface).await;
        }
    }
    if let Some(rest) = gate.finish() {
        let _ = tx.send(rest).await;
    }

    tracing::debug!(
        request_id = %request_id,
        provider = %provider,
        phase = "stream_done",
        bytes = outcome.content.len(),
        thinking_bytes = outcome.thinking.len(),
        "stream finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_all(parts: &[&str]) -> (Vec<String>, SurfaceGate) {
        let mut gate = SurfaceGate::new();
        let mut out = Vec::new();
        for p in parts {
            if let Some(s) = gate.push(p) {
                out.push(s);
            }
        }
        if let Some(s) = gate.finish() {
            out.push(s);
        }
        (out, gate)
    }

    #[test]
    fn test_sse_decoder_handles_split_frames() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: {\"a\"").is_empty());
        let frames = dec.push(b":1}\n\nevent: ping\ndata: x\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[1].event.as_deref(), Some("ping"));
    }

    #[test]
    fn test_sse_decoder_done_marker_and_comments() {
        let mut dec = SseDecoder::new();
        let frames = dec.push(b": keepalive\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_done_marker());
    }

    #[test]
    fn test_sse_decoder_flushes_unterminated_frame() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: tail").is_empty());
        assert_eq!(dec.finish().map(|f| f.data), Some("tail".to_string()));
    }

    #[test]
    fn test_gate_releases_after_control_packet() {
        let (out, gate) = gate_all(&[
            "{\"control_packet\": {\"intent_classification\": {\"verb\": \"/fix\"}},",
            " \"surface_response\": \"Hel",
            "lo\\nworld\"}",
        ]);
        assert!(gate.control_complete());
        assert_eq!(out.concat(), "Hello\nworld");
        assert_eq!(out[0], "Hel");
    }

    #[test]
    fn test_gate_holds_surface_that_precedes_control() {
        let mut gate = SurfaceGate::new();
        assert_eq!(gate.push("{\"surface_response\": \"hi there\", "), None);
        assert_eq!(gate.push("\"control_packet\": {\"a\": [1, {\"b\": \"}\"}]}}"), None);
        assert_eq!(gate.finish().as_deref(), Some("hi there"));
    }

    #[test]
    fn test_gate_ignores_nested_surface_keys_and_fences() {
        let (out, _) = gate_all(&[
            "```json\n{\"control_packet\": {\"surface_response\": \"no\"}, \"surface_response\": \"yes\"}\n```",
        ]);
        assert_eq!(out.concat(), "yes");
    }

    #[test]
    fn test_gate_decodes_unicode_escapes() {
        let (out, _) = gate_all(&[
            "{\"control_packet\": {}, \"surface_response\": \"caf\\u00e9 \\ud83d",
            "\\ude00 \\\"q\\\"\"}",
        ]);
        assert_eq!(out.concat(), "café 😀 \"q\"");
    }

    #[test]
    fn test_gate_without_control_packet_emits_nothing() {
        let (out, gate) = gate_all(&["{\"surface_response\": \"x\"}"]);
        assert!(out.is_empty());
        assert_eq!(gate.surface(), "x");
    }

    #[tokio::test]
    async fn test_from_content_finishes_immediately() {
        let mut stream = CompletionStream::from_content("claude-cli", "{}".into());
        assert_eq!(stream.next_chunk().await, None);
        assert_eq!(stream.finish().await.unwrap().content, "{}");
    }

    #[tokio::test]
    async fn test_from_content_emits_gated_surface() {
        let raw = "{\"control_packet\": {}, \"surface_response\": \"done\"}";
        let mut stream = CompletionStream::from_content("codex-cli", raw.into());
        assert_eq!(stream.next_chunk().await.as_deref(), Some("done"));
        assert_eq!(stream.next_chunk().await, None);
        assert_eq!(stream.finish().await.unwrap().content, raw);
    }
}
