use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{Router, body::Body, http::StatusCode, response::IntoResponse, routing::get};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

use action_hub::config::StreamConfig;
use action_hub::json_detail::{Fieldset, JsonDetailVisitor};
use action_hub::request::ScheduledPlan;
use action_hub::{HubError, JobKind, JobRequest};

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind tcp listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// 把文档切成小块逐块发送
fn chunked(doc: Vec<u8>, size: usize) -> Body {
    let chunks: Vec<Result<Vec<u8>, std::io::Error>> =
        doc.chunks(size).map(|c| Ok(c.to_vec())).collect();
    Body::from_stream(futures_util::stream::iter(chunks))
}

fn remote_request(url: String) -> JobRequest {
    JobRequest {
        kind: Some(JobKind::Query),
        scheduled_plan: Some(ScheduledPlan {
            download_url: Some(url),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn stream_cfg() -> StreamConfig {
    StreamConfig {
        request_timeout_ms: 5_000,
        channel_capacity: 2,
    }
}

#[derive(Default)]
struct Collect {
    rows: Vec<Value>,
    fields: Option<Fieldset>,
    ran_at: Option<String>,
}

impl JsonDetailVisitor for Collect {
    fn on_row(&mut self, row: Value) -> Result<(), HubError> {
        self.rows.push(row);
        Ok(())
    }
    fn on_fields(&mut self, fields: Fieldset) -> Result<(), HubError> {
        self.fields = Some(fields);
        Ok(())
    }
    fn on_ran_at(&mut self, ran_at: String) -> Result<(), HubError> {
        self.ran_at = Some(ran_at);
        Ok(())
    }
}

#[tokio::test]
async fn base64_json_detail_attachment_is_streamed() {
    let doc = json!({
        "fields": {"dimensions": [{"name": "users.email", "tags": ["email"]}]},
        "data": [
            {"users.email": {"value": "a@example.com"}},
            {"users.email": {"value": "b@example.com"}}
        ],
        "ran_at": "2024-01-01T00:00:00Z"
    });
    let payload = json!({
        "type": "query",
        "attachment": {
            "mimetype": "application/json;base64",
            "extension": "json",
            "data": STANDARD.encode(serde_json::to_vec(&doc).unwrap())
        },
        "form_params": {"format": "json_detail"},
        "data": {"api_key": "k"}
    });

    let request = JobRequest::from_payload(&payload).expect("parse payload");
    assert_eq!(request.kind, Some(JobKind::Query));
    assert_eq!(request.params.get("api_key").map(String::as_str), Some("k"));
    let fields = request
        .field_metadata()
        .expect("well-formed field metadata")
        .expect("inline field metadata");
    assert!(fields.dimensions[0].has_tag("email"));

    let mut visitor = Collect::default();
    let rows = request
        .stream_json_detail(&mut visitor)
        .await
        .expect("stream json_detail");
    assert_eq!(rows, 2);
    assert_eq!(visitor.rows[1]["users.email"]["value"], "b@example.com");
    assert_eq!(visitor.ran_at.as_deref(), Some("2024-01-01T00:00:00Z"));
    assert_eq!(visitor.fields.expect("fields").dimensions.len(), 1);
}

#[tokio::test]
async fn remote_rows_arrive_in_order_across_small_chunks() {
    let rows: Vec<Value> = (0..50).map(|i| json!({"id": i, "note": "x,]}\"y"})).collect();
    let doc = serde_json::to_vec(&rows).unwrap();
    let app = Router::new().route(
        "/rows",
        get(move || {
            let doc = doc.clone();
            async move { chunked(doc, 7) }
        }),
    );
    let addr = serve(app).await;

    let request = remote_request(format!("http://{addr}/rows"));
    let mut seen = Vec::new();
    let count = request
        .stream_with(&stream_cfg(), |bytes| {
            action_hub::json_stream::parse_rows(bytes, |row| {
                seen.push(row);
                Ok(())
            })
        })
        .await
        .expect("stream rows");
    assert_eq!(count, 50);
    assert_eq!(seen, rows);
}

#[tokio::test]
async fn non_success_status_is_a_stream_error() {
    let app = Router::new().route(
        "/gone",
        get(|| async { (StatusCode::NOT_FOUND, "missing").into_response() }),
    );
    let addr = serve(app).await;

    let request = remote_request(format!("http://{addr}/gone"));
    let err = request
        .stream_with(&stream_cfg(), |bytes| {
            action_hub::json_stream::parse_rows(bytes, |_row| Ok(()))
        })
        .await
        .unwrap_err();
    assert!(
        matches!(err, HubError::Stream(_) | HubError::Json(_)),
        "got {err:?}"
    );
}

#[tokio::test]
async fn consumer_abort_stops_the_download() {
    let served = Arc::new(AtomicUsize::new(0));
    let counter = served.clone();
    let app = Router::new().route(
        "/endless",
        get(move || {
            let counter = counter.clone();
            async move {
                // 很长的数组，逐块慢速发送
                let stream = futures_util::stream::unfold(0usize, move |i| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        let chunk = if i == 0 { "[1".to_string() } else { ",1".to_string() };
                        (i < 10_000).then_some((Ok::<_, std::io::Error>(chunk), i + 1))
                    }
                });
                Body::from_stream(stream)
            }
        }),
    );
    let addr = serve(app).await;

    let request = remote_request(format!("http://{addr}/endless"));
    let mut seen = 0;
    let err = request
        .stream_with(&stream_cfg(), |bytes| {
            action_hub::json_stream::parse_rows(bytes, |_row| {
                seen += 1;
                if seen == 3 {
                    Err(HubError::handler("enough"))
                } else {
                    Ok(())
                }
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Handler(_)));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let after_abort = served.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        served.load(Ordering::SeqCst) <= after_abort + 1,
        "server kept producing after the consumer gave up"
    );
    assert!(after_abort < 10_000);
}

/// 手写 HTTP 响应：声明 Content-Length，发送 `body` 后以 RST 关闭连接
async fn resetting_server(declared_len: usize, body: &'static [u8]) -> SocketAddr {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind tcp listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;
        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {declared_len}\r\n\r\n"
        );
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.write_all(body).await;
        let _ = socket.flush().await;
        // 等客户端读完已发送的数据再重置
        tokio::time::sleep(Duration::from_millis(200)).await;
        #[allow(deprecated)]
        let _ = socket.set_linger(Some(Duration::ZERO));
        drop(socket);
    });
    addr
}

#[tokio::test]
async fn reset_after_full_body_is_ignored() {
    const BODY: &[u8] = br#"[{"id": 1}, {"id": 2}]"#;
    let addr = resetting_server(BODY.len(), BODY).await;

    let request = remote_request(format!("http://{addr}/rows"));
    let mut seen = Vec::new();
    let count = request
        .stream_with(&stream_cfg(), |bytes| {
            action_hub::json_stream::parse_rows(bytes, |row| {
                seen.push(row);
                Ok(())
            })
        })
        .await
        .expect("reset after the declared length is harmless");
    assert_eq!(count, 2);
    assert_eq!(seen, vec![json!({"id": 1}), json!({"id": 2})]);
}

#[tokio::test]
async fn reset_before_full_body_is_a_stream_error() {
    const PARTIAL: &[u8] = br#"[{"id": 1}, {"id""#;
    let addr = resetting_server(PARTIAL.len() + 64, PARTIAL).await;

    let request = remote_request(format!("http://{addr}/rows"));
    let err = request
        .stream_with(&stream_cfg(), |bytes| {
            action_hub::json_stream::parse_rows(bytes, |_row| Ok(()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Stream(_)), "got {err:?}");
}

#[tokio::test]
async fn request_without_any_source_fails_fast() {
    let request = JobRequest {
        kind: Some(JobKind::Query),
        ..Default::default()
    };
    let err = request
        .stream_with(&stream_cfg(), |bytes| {
            action_hub::json_stream::parse_rows(bytes, |_row| Ok(()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::StreamSource(_)));
}
