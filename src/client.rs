use std::collections::VecDeque;
use std::env;
use std::pin::Pin;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::Stream;
use futures::stream::{self, StreamExt};
use reqwest::{Client as ReqwestClient, Response};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::observability::{
    CLIENT_REQUEST_DURATION, CLIENT_REQUEST_ERRORS, CLIENT_REQUESTS, STREAM_SKIPPED_LINES,
    STREAM_TOKENS, STREAM_TTFT,
};
use crate::types::{ChatOptions, ChatRequest, WireMessage};

/// Backend used when `OLLAMA_HOST` is unset.
pub const DEFAULT_HOST: &str = "http://localhost:11434";

/// Environment variable naming the backend base URL.
pub const HOST_ENV_VAR: &str = "OLLAMA_HOST";

const CHAT_PATH: &str = "/api/chat";
const CONNECT_TIMEOUT: Duration = Duration::from_millis(3050);

/// A lazy, finite sequence of text pieces produced by a streaming call.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/////////////////////////////////////////////// Timeouts ///////////////////////////////////////////////

/// Connect and read deadlines for one kind of call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Deadline for establishing the TCP connection.
    pub connect: Duration,
    /// Deadline for the response.  Blocking calls treat this as a bound on
    /// the whole exchange; streaming calls apply it between chunks.
    pub read: Duration,
}

impl Timeouts {
    /// Defaults for blocking calls.
    pub const BLOCKING: Timeouts = Timeouts {
        connect: CONNECT_TIMEOUT,
        read: Duration::from_secs(120),
    };

    /// Defaults for streaming calls.
    pub const STREAMING: Timeouts = Timeouts {
        connect: CONNECT_TIMEOUT,
        read: Duration::from_secs(300),
    };
}

///////////////////////////////////////////// ChatBackend /////////////////////////////////////////////

/// A chat-completion service.
///
/// The orchestrator only talks to the backend through this trait, so turns can
/// be driven by an in-memory backend in tests.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    /// Performs a blocking call and returns the full reply text.
    async fn chat(&self, request: ChatRequest) -> Result<String>;

    /// Performs a streaming call and returns the reply as it is produced.
    async fn chat_stream(&self, request: ChatRequest) -> Result<TokenStream>;
}

///////////////////////////////////////////// OllamaClient /////////////////////////////////////////////

/// Client for the Ollama chat endpoint.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: ReqwestClient,
    chat_url: Url,
    blocking: Timeouts,
    streaming: Timeouts,
}

impl OllamaClient {
    /// Create a client for the host named by `OLLAMA_HOST`, or the default
    /// local server.
    pub fn from_env() -> Result<Self> {
        let host = env::var(HOST_ENV_VAR).unwrap_or_else(|_| DEFAULT_HOST.to_string());
        Self::new(&host)
    }

    /// Create a client for `host` with the default timeouts.
    pub fn new(host: &str) -> Result<Self> {
        Self::with_timeouts(host, Timeouts::BLOCKING, Timeouts::STREAMING)
    }

    /// Create a client with custom timeouts.
    ///
    /// The connect deadline is a property of the underlying connection pool,
    /// so the blocking value is used for both kinds of call.
    pub fn with_timeouts(host: &str, blocking: Timeouts, streaming: Timeouts) -> Result<Self> {
        let chat_url = chat_url(host)?;
        let client = ReqwestClient::builder()
            .connect_timeout(blocking.connect)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {}", e),
                    Some(Box::new(e)),
                )
            })?;
        Ok(Self {
            client,
            chat_url,
            blocking,
            streaming,
        })
    }

    /// The fully resolved chat endpoint.
    pub fn chat_url(&self) -> &Url {
        &self.chat_url
    }

    /// Blocking chat call with explicit parameters.
    ///
    /// ```no_run
    /// # use localchat::{OllamaClient, Role, WireMessage};
    /// # tokio_test::block_on(async {
    /// let client = OllamaClient::new("http://localhost:11434")?;
    /// let reply = client
    ///     .chat_sync("llama3.2:3b", vec![WireMessage::new(Role::User, "Hello!")], None)
    ///     .await?;
    /// println!("{reply}");
    /// # Ok::<(), localchat::Error>(())
    /// # });
    /// ```
    pub async fn chat_sync(
        &self,
        model: &str,
        messages: Vec<WireMessage>,
        options: Option<ChatOptions>,
    ) -> Result<String> {
        let mut request = ChatRequest::new(model, messages);
        if let Some(options) = options {
            request = request.with_options(options);
        }
        self.send(request).await
    }

    async fn send(&self, mut request: ChatRequest) -> Result<String> {
        request.stream = false;
        CLIENT_REQUESTS.click();
        let start = Instant::now();
        debug!(url = %self.chat_url, model = %request.model, messages = request.messages.len(), "sending chat request");

        let result = async {
            let response = self
                .client
                .post(self.chat_url.clone())
                .timeout(self.blocking.read)
                .json(&request)
                .send()
                .await
                .map_err(|e| classify(e, self.blocking))?;
            let response = check_status(response).await?;
            let body = response.bytes().await.map_err(|e| classify(e, self.blocking))?;
            parse_reply(&body)
        }
        .await;

        CLIENT_REQUEST_DURATION.add(start.elapsed().as_secs_f64());
        if let Err(err) = &result {
            CLIENT_REQUEST_ERRORS.click();
            debug!(error = %err, "chat request failed");
        }
        result
    }

    async fn open_stream(&self, mut request: ChatRequest) -> Result<TokenStream> {
        request.stream = true;
        CLIENT_REQUESTS.click();
        debug!(url = %self.chat_url, model = %request.model, messages = request.messages.len(), "opening chat stream");

        let timeouts = self.streaming;
        let send = self.client.post(self.chat_url.clone()).json(&request).send();
        let response = match tokio::time::timeout(timeouts.read, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                CLIENT_REQUEST_ERRORS.click();
                return Err(classify(e, timeouts));
            }
            Err(_) => {
                CLIENT_REQUEST_ERRORS.click();
                return Err(Error::timeout(
                    "no response from backend",
                    Some(timeouts.read.as_secs_f64()),
                ));
            }
        };
        let response = check_status(response).await.inspect_err(|_| {
            CLIENT_REQUEST_ERRORS.click();
        })?;
        Ok(Box::pin(decode_stream(
            Box::pin(response.bytes_stream()),
            timeouts,
            Instant::now(),
        )))
    }
}

#[async_trait::async_trait]
impl ChatBackend for OllamaClient {
    async fn chat(&self, request: ChatRequest) -> Result<String> {
        self.send(request).await
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<TokenStream> {
        self.open_stream(request).await
    }
}

/// Resolves the chat endpoint for a host such as `http://localhost:11434`
/// or a bare `127.0.0.1:11434`.
pub fn chat_url(host: &str) -> Result<Url> {
    let host = host.trim();
    let base = if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{host}")
    };
    let base = Url::parse(&base)?;
    Ok(base.join(CHAT_PATH)?)
}

fn classify(e: reqwest::Error, timeouts: Timeouts) -> Error {
    if e.is_timeout() {
        Error::timeout(
            format!("Request timed out: {}", e),
            Some(timeouts.read.as_secs_f64()),
        )
    } else if e.is_connect() {
        Error::connection(
            "could not reach the Ollama server; is it running?",
            Some(Box::new(e)),
        )
    } else {
        Error::http_client(format!("Request failed: {}", e), Some(Box::new(e)))
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.as_u16() < 400 {
        return Ok(response);
    }

    #[derive(Deserialize)]
    struct ErrorResponse {
        error: Option<String>,
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .ok()
        .and_then(|e| e.error)
        .unwrap_or(body);
    debug!(status = status.as_u16(), message = %message, "backend returned an error status");
    Err(Error::protocol(
        format!("backend returned an error: {message}"),
        Some(status.as_u16()),
    ))
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatReply {
    message: Option<ReplyMessage>,
    #[serde(default)]
    done: bool,
}

fn parse_reply(body: &[u8]) -> Result<String> {
    let reply: ChatReply = serde_json::from_slice(body)
        .map_err(|_| Error::protocol("response body is not valid JSON", None))?;
    reply
        .message
        .and_then(|m| m.content)
        .ok_or_else(|| Error::protocol("response is missing message.content", None))
}

////////////////////////////////////////////// Streaming //////////////////////////////////////////////

/// Incremental decoder for newline-delimited JSON chat chunks.
///
/// Blank lines, lines that are not JSON and chunks without content are
/// skipped.  Once a chunk with `done: true` is seen, further input is ignored.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl NdjsonDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the terminating chunk has been decoded.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds raw bytes; complete lines are decoded into `out`.
    pub fn push(&mut self, bytes: &[u8], out: &mut VecDeque<String>) {
        if self.done {
            return;
        }
        self.buffer.extend_from_slice(bytes);
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            self.decode_line(&line, out);
            if self.done {
                self.buffer.clear();
                return;
            }
        }
    }

    /// Decodes whatever remains after the body ends.
    pub fn finish(&mut self, out: &mut VecDeque<String>) {
        if !self.done && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&line, out);
        }
        self.done = true;
    }

    fn decode_line(&mut self, line: &[u8], out: &mut VecDeque<String>) {
        let Ok(line) = std::str::from_utf8(line) else {
            STREAM_SKIPPED_LINES.click();
            debug!("skipping non-UTF-8 stream line");
            return;
        };
        let mut line = line.trim();
        if let Some(rest) = line.strip_prefix("data:") {
            line = rest.trim();
        }
        if line.is_empty() {
            return;
        }
        let chunk: ChatReply = match serde_json::from_str(line) {
            Ok(chunk) => chunk,
            Err(err) => {
                STREAM_SKIPPED_LINES.click();
                debug!(error = %err, "skipping malformed stream line");
                return;
            }
        };
        if let Some(piece) = chunk.message.and_then(|m| m.content)
            && !piece.is_empty()
        {
            out.push_back(piece);
        }
        if chunk.done {
            self.done = true;
        }
    }
}

struct StreamState<S> {
    inner: S,
    decoder: NdjsonDecoder,
    pending: VecDeque<String>,
    finished: bool,
    first_token: bool,
}

/// Turns a byte stream into text pieces, applying `timeouts.read` as an idle
/// deadline between chunks.
fn decode_stream<S>(
    byte_stream: S,
    timeouts: Timeouts,
    started: Instant,
) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Unpin + Send + 'static,
{
    let state = StreamState {
        inner: byte_stream,
        decoder: NdjsonDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
        first_token: true,
    };

    stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(piece) = state.pending.pop_front() {
                if state.first_token {
                    state.first_token = false;
                    STREAM_TTFT.add(started.elapsed().as_secs_f64());
                }
                STREAM_TOKENS.click();
                return Some((Ok(piece), state));
            }
            if state.finished {
                return None;
            }
            match tokio::time::timeout(timeouts.read, state.inner.next()).await {
                Ok(Some(Ok(bytes))) => {
                    state.decoder.push(&bytes, &mut state.pending);
                    state.finished = state.decoder.is_done();
                }
                Ok(Some(Err(e))) => {
                    state.finished = true;
                    CLIENT_REQUEST_ERRORS.click();
                    return Some((Err(classify(e, timeouts)), state));
                }
                Ok(None) => {
                    state.decoder.finish(&mut state.pending);
                    state.finished = true;
                }
                Err(_) => {
                    state.finished = true;
                    CLIENT_REQUEST_ERRORS.click();
                    return Some((
                        Err(Error::timeout(
                            "backend stopped sending data",
                            Some(timeouts.read.as_secs_f64()),
                        )),
                        state,
                    ));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(chunks: &[&str]) -> Vec<String> {
        let mut decoder = NdjsonDecoder::new();
        let mut out = VecDeque::new();
        for chunk in chunks {
            decoder.push(chunk.as_bytes(), &mut out);
        }
        decoder.finish(&mut out);
        out.into_iter().collect()
    }

    #[test]
    fn chat_url_resolution() {
        assert_eq!(
            chat_url("http://localhost:11434").unwrap().as_str(),
            "http://localhost:11434/api/chat"
        );
        assert_eq!(
            chat_url("http://localhost:11434/").unwrap().as_str(),
            "http://localhost:11434/api/chat"
        );
        assert_eq!(
            chat_url("127.0.0.1:9999").unwrap().as_str(),
            "http://127.0.0.1:9999/api/chat"
        );
        assert!(chat_url("http://").is_err());
    }

    #[test]
    fn client_creation() {
        let client = OllamaClient::new(DEFAULT_HOST).unwrap();
        assert_eq!(client.blocking, Timeouts::BLOCKING);
        assert_eq!(client.streaming, Timeouts::STREAMING);
        assert_eq!(client.chat_url().path(), "/api/chat");
    }

    #[test]
    fn default_timeouts() {
        assert_eq!(Timeouts::BLOCKING.connect, Duration::from_millis(3050));
        assert_eq!(Timeouts::BLOCKING.read, Duration::from_secs(120));
        assert_eq!(Timeouts::STREAMING.connect, Duration::from_millis(3050));
        assert_eq!(Timeouts::STREAMING.read, Duration::from_secs(300));
    }

    #[test]
    fn parse_reply_requires_content() {
        assert_eq!(
            parse_reply(br#"{"message":{"role":"assistant","content":"hi"},"done":true}"#)
                .unwrap(),
            "hi"
        );
        assert!(parse_reply(br#"{"done":true}"#).unwrap_err().is_protocol());
        assert!(parse_reply(br#"{"message":{}}"#).unwrap_err().is_protocol());
        assert!(parse_reply(b"<html>").unwrap_err().is_protocol());
    }

    #[test]
    fn decoder_handles_split_lines() {
        let pieces = decode_all(&[
            "{\"message\":{\"content\":\"Hel\"},\"done\":false}\n{\"message\":",
            "{\"content\":\"lo\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true}\n",
        ]);
        assert_eq!(pieces, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[test]
    fn decoder_skips_noise() {
        let pieces = decode_all(&[
            "\n",
            "not json\n",
            "data: {\"message\":{\"content\":\"a\"},\"done\":false}\n",
            "{\"unexpected\":1}\n",
            "{\"message\":{\"content\":\"b\"},\"done\":false}\n",
        ]);
        assert_eq!(pieces, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn decoder_stops_at_done() {
        let pieces = decode_all(&[
            "{\"message\":{\"content\":\"x\"},\"done\":true}\n",
            "{\"message\":{\"content\":\"ignored\"},\"done\":false}\n",
        ]);
        assert_eq!(pieces, vec!["x".to_string()]);
    }

    #[test]
    fn decoder_flushes_trailing_line() {
        let pieces = decode_all(&["{\"message\":{\"content\":\"tail\"},\"done\":true}"]);
        assert_eq!(pieces, vec!["tail".to_string()]);
    }

    #[test]
    fn decoder_keeps_multibyte_characters_split_across_chunks() {
        let line = "{\"message\":{\"content\":\"görüşürüz\"},\"done\":true}\n";
        let bytes = line.as_bytes();
        let split = line.find('ü').unwrap() + 1;
        let mut decoder = NdjsonDecoder::new();
        let mut out = VecDeque::new();
        decoder.push(&bytes[..split], &mut out);
        decoder.push(&bytes[split..], &mut out);
        assert_eq!(out.into_iter().collect::<Vec<_>>(), vec!["görüşürüz"]);
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = OllamaClient::new(&format!("http://{addr}")).unwrap();
        let err = client
            .chat_sync("m", vec![WireMessage::new(crate::Role::User, "hi")], None)
            .await
            .unwrap_err();
        assert!(err.is_connection(), "unexpected error: {err}");
    }
}
