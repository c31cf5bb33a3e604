//! Integration tests for localchat.
//! These tests run the client and the chat session against an in-process
//! fake Ollama server.

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::ops::ControlFlow;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures::StreamExt;
    use rustyline::error::ReadlineError;
    use serde_json::Value;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use localchat::chat::{
        Brain, ChatSession, ChatState, CommandRouter, Console, ExitRequest, Indicator, Renderer,
    };
    use localchat::client::Timeouts;
    use localchat::{ChatBackend, ChatOptions, ChatRequest, OllamaClient, Role, WireMessage};

    ////////////////////////////////////////// fake server //////////////////////////////////////////

    struct Reply {
        status: u16,
        chunks: Vec<String>,
        delay: Duration,
        hold: Duration,
    }

    impl Reply {
        fn json(status: u16, body: Value) -> Self {
            Self {
                status,
                chunks: vec![body.to_string()],
                delay: Duration::ZERO,
                hold: Duration::ZERO,
            }
        }

        fn content(text: &str) -> Self {
            Self::json(200, serde_json::json!({"message": {"role": "assistant", "content": text}}))
        }

        fn ndjson(lines: &[&str]) -> Self {
            Self {
                status: 200,
                chunks: lines.iter().map(|l| format!("{l}\n")).collect(),
                delay: Duration::from_millis(5),
                hold: Duration::ZERO,
            }
        }

        fn paced(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn then_hold(mut self, hold: Duration) -> Self {
            self.hold = hold;
            self
        }

        fn stalled(delay: Duration) -> Self {
            Self {
                status: 200,
                chunks: vec![],
                delay,
                hold: Duration::ZERO,
            }
        }
    }

    type Requests = Arc<Mutex<Vec<Value>>>;

    async fn read_request(socket: &mut TcpStream) -> Option<Value> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(at) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break at + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
        let length = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + length {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        serde_json::from_slice(&buf[header_end..]).ok()
    }

    /// Serves `replies` in order, one connection each, and records request bodies.
    async fn serve(replies: Vec<Reply>) -> (String, Requests) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = format!("http://{}", listener.local_addr().unwrap());
        let requests: Requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();
        tokio::spawn(async move {
            for reply in replies {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                if let Some(body) = read_request(&mut socket).await {
                    recorded.lock().unwrap().push(body);
                }
                if reply.chunks.is_empty() {
                    tokio::time::sleep(reply.delay).await;
                    continue;
                }
                let head = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n",
                    reply.status
                );
                let _ = socket.write_all(head.as_bytes()).await;
                for chunk in &reply.chunks {
                    let _ = socket.write_all(chunk.as_bytes()).await;
                    let _ = socket.flush().await;
                    tokio::time::sleep(reply.delay).await;
                }
                tokio::time::sleep(reply.hold).await;
                let _ = socket.shutdown().await;
            }
        });
        (host, requests)
    }

    async fn refused_host() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    ///////////////////////////////////////// test doubles /////////////////////////////////////////

    #[derive(Default)]
    struct ScriptedConsole {
        printed: Vec<String>,
        input: VecDeque<String>,
    }

    impl Console for ScriptedConsole {
        fn print_sys(&mut self, text: &str) {
            self.printed.push(text.to_string());
        }

        fn read_line(&mut self, _prompt: &str) -> Result<String, ReadlineError> {
            self.input.pop_front().ok_or(ReadlineError::Eof)
        }
    }

    #[derive(Default)]
    struct CapturingRenderer {
        output: String,
        headers: usize,
    }

    impl Renderer for CapturingRenderer {
        fn print_header(&mut self) {
            self.headers += 1;
            self.output.push_str("Bot  > ");
        }

        fn print_text(&mut self, text: &str) {
            self.output.push_str(text);
        }

        fn finish_response(&mut self) {
            self.output.push('\n');
        }
    }

    #[derive(Default)]
    struct CountingIndicator {
        running: bool,
        starts: usize,
        stops: usize,
    }

    impl Indicator for CountingIndicator {
        fn start(&mut self) {
            self.running = true;
            self.starts += 1;
        }

        fn stop(&mut self) {
            if self.running {
                self.stops += 1;
            }
            self.running = false;
        }

        fn is_running(&self) -> bool {
            self.running
        }
    }

    struct Harness {
        session: ChatSession,
        console: ScriptedConsole,
        renderer: CapturingRenderer,
        indicator: CountingIndicator,
    }

    impl Harness {
        fn new(host: &str, username: &str) -> Self {
            let client = OllamaClient::new(host).unwrap();
            let state = ChatState::new(username);
            let brain = Brain::with_web_tool(&state, Arc::new(client), None);
            Self {
                session: ChatSession::new(state, CommandRouter::with_default_commands(), brain),
                console: ScriptedConsole::default(),
                renderer: CapturingRenderer::default(),
                indicator: CountingIndicator::default(),
            }
        }

        async fn send(&mut self, line: &str) -> ControlFlow<ExitRequest> {
            self.session
                .handle_line(
                    line,
                    &mut self.console,
                    &mut self.renderer,
                    &mut self.indicator,
                )
                .await
        }
    }

    ////////////////////////////////////////////// client //////////////////////////////////////////////

    #[tokio::test]
    async fn blocking_chat_returns_reply_content() {
        let (host, requests) = serve(vec![Reply::content("Hello!")]).await;
        let client = OllamaClient::new(&host).unwrap();
        let reply = client
            .chat_sync(
                "llama3.2:3b",
                vec![WireMessage::new(Role::User, "hi")],
                Some(ChatOptions {
                    temperature: Some(0.5),
                    stop: None,
                }),
            )
            .await
            .unwrap();
        assert_eq!(reply, "Hello!");

        let body = &requests.lock().unwrap()[0];
        assert_eq!(body["model"], "llama3.2:3b");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["options"]["temperature"], 0.5);
    }

    #[tokio::test]
    async fn streaming_chat_skips_noise_and_stops_at_done() {
        let (host, requests) = serve(vec![Reply::ndjson(&[
            r#"{"message":{"content":"Hel"},"done":false}"#,
            "not json",
            "",
            r#"data: {"message":{"content":"lo"},"done":false}"#,
            r#"{"message":{"content":""},"done":false}"#,
            r#"{"message":{"content":"!"},"done":true}"#,
            r#"{"message":{"content":"after"},"done":false}"#,
        ])])
        .await;
        let client = OllamaClient::new(&host).unwrap();
        let mut stream = client
            .chat_stream(ChatRequest::new("m", vec![WireMessage::new(Role::User, "hi")]))
            .await
            .unwrap();

        let mut pieces = Vec::new();
        while let Some(piece) = stream.next().await {
            pieces.push(piece.unwrap());
        }
        assert_eq!(pieces, vec!["Hel", "lo", "!"]);
        assert_eq!(requests.lock().unwrap()[0]["stream"], true);
    }

    #[tokio::test]
    async fn error_status_is_a_protocol_error() {
        let (host, _) = serve(vec![Reply::json(
            404,
            serde_json::json!({"error": "model \"nope\" not found"}),
        )])
        .await;
        let client = OllamaClient::new(&host).unwrap();
        let err = client.chat_sync("nope", vec![], None).await.unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(err.status_code(), Some(404));
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn streaming_error_status_is_a_protocol_error() {
        let (host, _) = serve(vec![Reply::json(500, serde_json::json!({"error": "boom"}))]).await;
        let client = OllamaClient::new(&host).unwrap();
        let err = match client.chat_stream(ChatRequest::new("m", vec![])).await {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert!(err.is_protocol());
        assert_eq!(err.status_code(), Some(500));
    }

    #[tokio::test]
    async fn missing_content_is_a_protocol_error() {
        let (host, _) = serve(vec![Reply::json(200, serde_json::json!({"done": true}))]).await;
        let client = OllamaClient::new(&host).unwrap();
        let err = client.chat_sync("m", vec![], None).await.unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn silent_backend_times_out() {
        let (host, _) = serve(vec![Reply::stalled(Duration::from_secs(2))]).await;
        let client = quick_client(&host, Duration::from_millis(200));
        let err = client.chat_sync("m", vec![], None).await.unwrap_err();
        assert!(err.is_timeout(), "{err}");
    }

    fn quick_client(host: &str, read: Duration) -> OllamaClient {
        let quick = Timeouts {
            connect: Duration::from_secs(1),
            read,
        };
        OllamaClient::with_timeouts(host, quick, quick).unwrap()
    }

    #[tokio::test]
    async fn stream_that_stalls_mid_body_times_out() {
        let (host, _) = serve(vec![
            Reply::ndjson(&[r#"{"message":{"content":"Hel"},"done":false}"#])
                .then_hold(Duration::from_secs(2)),
        ])
        .await;
        let client = quick_client(&host, Duration::from_millis(200));
        let mut stream = client
            .chat_stream(ChatRequest::new("m", vec![WireMessage::new(Role::User, "hi")]))
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), "Hel");
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_timeout(), "{err}");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_without_a_response_head_times_out() {
        let (host, _) = serve(vec![Reply::stalled(Duration::from_secs(2))]).await;
        let client = quick_client(&host, Duration::from_millis(200));
        let err = match client.chat_stream(ChatRequest::new("m", vec![])).await {
            Ok(_) => panic!("expected a timeout"),
            Err(err) => err,
        };
        assert!(err.is_timeout(), "{err}");
    }

    #[tokio::test]
    async fn steady_stream_outlives_the_read_deadline() {
        let (host, _) = serve(vec![
            Reply::ndjson(&[
                r#"{"message":{"content":"a"},"done":false}"#,
                r#"{"message":{"content":"b"},"done":false}"#,
                r#"{"message":{"content":"c"},"done":false}"#,
                r#"{"message":{"content":"d"},"done":false}"#,
                r#"{"message":{"content":"e"},"done":true}"#,
            ])
            .paced(Duration::from_millis(150)),
        ])
        .await;
        let client = quick_client(&host, Duration::from_millis(400));
        let started = std::time::Instant::now();
        let mut stream = client
            .chat_stream(ChatRequest::new("m", vec![WireMessage::new(Role::User, "hi")]))
            .await
            .unwrap();

        let mut reply = String::new();
        while let Some(piece) = stream.next().await {
            reply.push_str(&piece.unwrap());
        }
        assert_eq!(reply, "abcde");
        assert!(started.elapsed() > Duration::from_millis(400));
    }

    #[tokio::test]
    async fn refused_connection_is_a_connection_error() {
        let client = OllamaClient::new(&refused_host().await).unwrap();
        let err = client.chat_sync("m", vec![], None).await.unwrap_err();
        assert!(err.is_connection(), "{err}");
    }

    ////////////////////////////////////////////// session //////////////////////////////////////////////

    #[tokio::test]
    async fn streamed_turn_is_rendered_and_logged() {
        let (host, _) = serve(vec![Reply::ndjson(&[
            r#"{"message":{"content":"Hi "},"done":false}"#,
            r#"{"message":{"content":"alice"},"done":true}"#,
        ])])
        .await;
        let mut h = Harness::new(&host, "alice");
        assert_eq!(h.send("hello").await, ControlFlow::Continue(()));

        assert_eq!(h.renderer.output, "Bot  > Hi alice\n");
        assert_eq!(h.renderer.headers, 1);
        assert_eq!(h.indicator.starts, 1);
        assert_eq!(h.indicator.stops, 1);
        assert!(!h.indicator.is_running());

        let messages = h.session.state().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content.text(), "Hi alice");
    }

    #[tokio::test]
    async fn blocking_turn_is_rendered_after_the_reply() {
        let (host, requests) = serve(vec![Reply::content("Sure.")]).await;
        let mut h = Harness::new(&host, "alice");
        h.send("/set stream off").await;
        h.send("  can you help?  ").await;

        assert_eq!(h.renderer.output, "Bot  > Sure.\n");
        let body = &requests.lock().unwrap()[0];
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][1]["content"], "can you help?");
    }

    #[tokio::test]
    async fn refused_connection_prints_one_notice() {
        let mut h = Harness::new(&refused_host().await, "alice");
        assert_eq!(h.send("hello").await, ControlFlow::Continue(()));

        assert_eq!(h.console.printed.len(), 1);
        assert!(h.console.printed[0].starts_with("[Error] Connection error"));
        assert!(h.renderer.output.is_empty());
        assert!(!h.indicator.is_running());
        let messages = h.session.state().messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn renamed_user_starts_a_fresh_history() {
        let (host, requests) = serve(vec![
            Reply::content("one"),
            Reply::content("two"),
            Reply::content("three"),
        ])
        .await;
        let mut h = Harness::new(&host, "alice");
        h.send("/set stream off").await;
        h.send("first").await;
        h.send("second").await;
        h.send("--change_username bob").await;
        h.send("third").await;

        let requests = requests.lock().unwrap();
        assert_eq!(requests[1]["messages"].as_array().unwrap().len(), 4);
        let bob = requests[2]["messages"].as_array().unwrap();
        assert_eq!(bob.len(), 2);
        assert_eq!(bob[0]["role"], "system");
        assert_eq!(bob[1]["content"], "third");
        assert_eq!(h.session.state().username, "bob");
    }

    #[tokio::test]
    async fn model_change_applies_to_the_next_turn() {
        let (host, requests) = serve(vec![Reply::content("ok")]).await;
        let mut h = Harness::new(&host, "alice");
        h.send("/set stream off").await;
        h.send("/set model llama3.2:1b").await;
        h.send("/set temp 0.2").await;
        h.send("hi").await;

        let body = &requests.lock().unwrap()[0];
        assert_eq!(body["model"], "llama3.2:1b");
        let temperature = body["options"]["temperature"].as_f64().unwrap();
        assert!((temperature - 0.2).abs() < 1e-6);
        assert_eq!(h.session.brain().rebuild_count(), 4);
    }

    #[tokio::test]
    async fn commands_never_reach_the_backend() {
        let mut h = Harness::new(&refused_host().await, "alice");
        h.send("/help").await;
        h.send("/nope").await;
        h.send("--username").await;
        h.send("").await;
        assert_eq!(h.session.state().message_count(), 0);
        assert_eq!(h.indicator.starts, 0);
        assert!(h.console.printed.iter().any(|l| l == "Unknown command: /nope"));
    }

    #[tokio::test]
    async fn exit_and_alias_end_the_session() {
        let mut h = Harness::new(&refused_host().await, "alice");
        assert_eq!(
            h.send(":q").await,
            ControlFlow::Break(ExitRequest { code: 0 })
        );
        assert_eq!(
            h.send("/exit").await,
            ControlFlow::Break(ExitRequest { code: 0 })
        );
    }

    #[tokio::test]
    async fn colon_smiley_is_a_chat_turn() {
        let mut h = Harness::new(&refused_host().await, "alice");
        assert_eq!(h.send(":) thanks, that helped").await, ControlFlow::Continue(()));
        assert_eq!(h.indicator.starts, 1);
        assert_eq!(
            h.session.state().messages()[0].content.text(),
            ":) thanks, that helped"
        );
        assert!(!h.console.printed.iter().any(|l| l.starts_with("Unknown command")));
    }

    #[tokio::test]
    async fn bare_exit_word_is_a_chat_turn() {
        let mut h = Harness::new(&refused_host().await, "alice");
        assert_eq!(h.send("exit").await, ControlFlow::Continue(()));
        assert_eq!(h.session.state().messages()[0].content.text(), "exit");
    }
}
