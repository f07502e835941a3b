use bokji_ai::providers::openai::OpenAIProvider;
use bokji_ai::{ChatProvider, Context, Error, Message, Model, RequestOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serve one canned HTTP response and hand back the raw request
async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            raw.extend_from_slice(&buf[..n]);
            if n == 0 || request_complete(&raw) {
                break;
            }
        }
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&raw).into_owned()
    });

    (base_url, handle)
}

fn request_complete(raw: &[u8]) -> bool {
    let text = String::from_utf8_lossy(raw);
    let Some(split) = text.find("\r\n\r\n") else {
        return false;
    };
    let length = text[..split]
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    raw.len() >= split + 4 + length
}

fn sse_response(chunks: &[&str]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":{}}},\"finish_reason\":null}}]}}\n\n",
            serde_json::to_string(chunk).unwrap()
        ));
    }
    body.push_str("data: [DONE]\n\n");
    format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

#[tokio::test]
async fn complete_accumulates_streamed_deltas() {
    let (base_url, server) = serve_once(sse_response(&["결론: ", "지원 대상입니다."])).await;
    let provider = OpenAIProvider::new("sk-test");
    let model = Model::openai("gpt-4o-mini").with_base_url(base_url);
    let mut context = Context::with_system("상담사");
    context.push(Message::user("재난적의료비 대상인가요?"));

    let text = provider
        .complete(&model, &context, &RequestOptions::json())
        .await
        .unwrap();
    assert_eq!(text, "결론: 지원 대상입니다.");

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /chat/completions"));
    assert!(request.to_lowercase().contains("authorization: bearer sk-test"));
    assert!(request.contains("\"json_object\""));
}

fn status_response(status_line: &str, extra_headers: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\n{extra_headers}content-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len(),
    )
}

#[tokio::test]
async fn unauthorized_status_is_invalid_api_key() {
    let response = status_response("401 Unauthorized", "", r#"{"error":{"message":"bad key"}}"#);
    let (base_url, _server) = serve_once(response).await;
    let provider = OpenAIProvider::new("sk-test");
    let model = Model::default().with_base_url(base_url);

    let err = provider
        .complete(&model, &Context::default(), &RequestOptions::text(0.2))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidApiKey), "unexpected error: {err:?}");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn too_many_requests_is_rate_limited() {
    let response = status_response(
        "429 Too Many Requests",
        "retry-after: 3\r\n",
        r#"{"error":{"message":"slow down"}}"#,
    );
    let (base_url, _server) = serve_once(response).await;
    let provider = OpenAIProvider::new("sk-test");
    let model = Model::default().with_base_url(base_url);

    let err = provider
        .complete(&model, &Context::default(), &RequestOptions::text(0.2))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::RateLimited { retry_after: Some(3) }),
        "unexpected error: {err:?}"
    );
    assert!(err.is_retryable());
}

#[test]
fn missing_key_is_not_retryable() {
    let err = bokji_ai::providers::get_api_key(None, "BOKJI_TEST_UNSET_KEY").unwrap_err();
    assert!(matches!(err, Error::InvalidApiKey));
    assert!(!err.is_retryable());
    assert_eq!(err.kind(), "config");
}
