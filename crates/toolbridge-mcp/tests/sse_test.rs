//! Persistent SSE transport against a minimal in-process server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::Url;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use toolbridge_mcp::protocol::JsonRpcMessage;
use toolbridge_mcp::transport::{event_channel, EventReceiver, SseTransport};
use toolbridge_mcp::{Transport, TransportError, TransportEvent};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

const STREAM_HEAD: &str =
    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n";

/// Serves `GET /sse` as an event stream and answers `POST`s on it.
struct FakeServer {
    addr: SocketAddr,
    gets: Arc<AtomicUsize>,
    posts: Arc<Mutex<Vec<String>>>,
    stream: Arc<tokio::sync::Mutex<Option<TcpStream>>>,
}

#[derive(Clone, Copy)]
struct Behavior {
    endpoint: &'static str,
    /// Close the first stream right after the endpoint event.
    drop_first: bool,
    /// Written without a terminating blank line before the first stream closes.
    trailing: Option<&'static str>,
}

impl FakeServer {
    async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Self {
            addr: listener.local_addr().unwrap(),
            gets: Arc::new(AtomicUsize::new(0)),
            posts: Arc::new(Mutex::new(Vec::new())),
            stream: Arc::new(tokio::sync::Mutex::new(None)),
        };

        let (gets, posts, stream) = (server.gets.clone(), server.posts.clone(), server.stream.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let (gets, posts, stream) = (gets.clone(), posts.clone(), stream.clone());
                tokio::spawn(async move {
                    serve(socket, behavior, gets, posts, stream).await;
                });
            }
        });
        server
    }

    fn url(&self) -> Url {
        Url::parse(&format!("http://{}/sse", self.addr)).unwrap()
    }

    fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

async fn read_request(socket: &mut TcpStream) -> Option<(String, String, Vec<u8>)> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let mut request_line = head.lines().next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    let length: usize = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0);

    let mut body = buffer[head_end..].to_vec();
    while body.len() < length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Some((method, target, body))
}

async fn serve(
    mut socket: TcpStream,
    behavior: Behavior,
    gets: Arc<AtomicUsize>,
    posts: Arc<Mutex<Vec<String>>>,
    stream: Arc<tokio::sync::Mutex<Option<TcpStream>>>,
) {
    let Some((method, target, body)) = read_request(&mut socket).await else {
        return;
    };

    if method == "GET" {
        let count = gets.fetch_add(1, Ordering::SeqCst) + 1;
        let opening = format!("{}event: endpoint\ndata: {}\n\n", STREAM_HEAD, behavior.endpoint);
        if socket.write_all(opening.as_bytes()).await.is_err() {
            return;
        }
        let _ = socket.flush().await;
        if behavior.drop_first && count == 1 {
            if let Some(trailing) = behavior.trailing {
                let _ = socket.write_all(trailing.as_bytes()).await;
                let _ = socket.flush().await;
            }
            return;
        }
        *stream.lock().await = Some(socket);
        return;
    }

    posts.lock().push(target);
    let _ = socket
        .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await;

    let message: Value = serde_json::from_slice(&body).unwrap_or_default();
    let Some(id) = message.get("id") else {
        return;
    };
    let response = json!({"jsonrpc": "2.0", "id": id, "result": {"echo": message["method"]}});
    if let Some(stream) = stream.lock().await.as_mut() {
        let _ = stream
            .write_all(format!("event: message\ndata: {}\n\n", response).as_bytes())
            .await;
        let _ = stream.flush().await;
    }
}

async fn next_event(rx: &mut EventReceiver, within: Duration) -> TransportEvent {
    tokio::time::timeout(within, rx.recv())
        .await
        .expect("no event in time")
        .expect("channel closed")
}

#[tokio::test]
async fn test_endpoint_event_sets_post_target() {
    let server = FakeServer::start(Behavior {
        endpoint: "/messages?session=1",
        drop_first: false,
        trailing: None,
    })
    .await;

    let transport = SseTransport::new("sse-test", server.url(), HeaderMap::new()).unwrap();
    let (tx, mut rx) = event_channel();
    transport.start(tx).await.unwrap();

    assert_eq!(
        transport.endpoint().as_str(),
        format!("http://{}/messages?session=1", server.addr)
    );

    transport
        .send(JsonRpcMessage::request(1u64, "tools/list", None))
        .await
        .unwrap();

    match next_event(&mut rx, Duration::from_secs(2)).await {
        TransportEvent::Message(JsonRpcMessage::Response(response)) => {
            assert_eq!(response.id.and_then(|id| id.as_u64()), Some(1));
            assert_eq!(response.result.unwrap()["echo"], "tools/list");
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(server.posts.lock().clone(), vec!["/messages?session=1".to_string()]);

    transport.stop().await;
    assert!(matches!(next_event(&mut rx, Duration::from_secs(3)).await, TransportEvent::Closed(None)));
}

#[tokio::test]
async fn test_json_endpoint_payload() {
    let server = FakeServer::start(Behavior {
        endpoint: r#"{"uri": "/rpc"}"#,
        drop_first: false,
        trailing: None,
    })
    .await;

    let transport = SseTransport::new("sse-test", server.url(), HeaderMap::new()).unwrap();
    let (tx, _rx) = event_channel();
    transport.start(tx).await.unwrap();

    assert_eq!(transport.endpoint().path(), "/rpc");
    transport.stop().await;
}

#[tokio::test]
async fn test_dropped_stream_reconnects() {
    let server = FakeServer::start(Behavior {
        endpoint: "/messages",
        drop_first: true,
        trailing: None,
    })
    .await;

    let transport = SseTransport::new("sse-test", server.url(), HeaderMap::new()).unwrap();
    let (tx, mut rx) = event_channel();
    transport.start(tx).await.unwrap();

    match next_event(&mut rx, Duration::from_secs(2)).await {
        TransportEvent::Error(TransportError::Reconnecting { attempt, delay, .. }) => {
            assert_eq!(attempt, 1);
            assert_eq!(delay, Duration::from_secs(1));
        }
        other => panic!("expected a reconnect notice, got {:?}", other),
    }

    let mut reopened = false;
    for _ in 0..40 {
        if server.gets() >= 2 {
            reopened = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(reopened, "stream was not reopened");

    // The reopened stream stays up; nothing else is reported.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());

    transport
        .send(JsonRpcMessage::request(2u64, "ping", None))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut rx, Duration::from_secs(2)).await,
        TransportEvent::Message(JsonRpcMessage::Response(_))
    ));

    transport.stop().await;
    assert!(matches!(next_event(&mut rx, Duration::from_secs(3)).await, TransportEvent::Closed(None)));
}

#[tokio::test]
async fn test_unterminated_last_event_is_delivered() {
    let server = FakeServer::start(Behavior {
        endpoint: "/messages",
        drop_first: true,
        trailing: Some("event: endpoint\ndata: /moved"),
    })
    .await;

    let transport = SseTransport::new("sse-test", server.url(), HeaderMap::new()).unwrap();
    let (tx, mut rx) = event_channel();
    transport.start(tx).await.unwrap();

    // The stream has ended; the reopen happens only after a 1s delay.
    assert!(matches!(
        next_event(&mut rx, Duration::from_secs(2)).await,
        TransportEvent::Error(TransportError::Reconnecting { attempt: 1, .. })
    ));
    assert_eq!(transport.endpoint().path(), "/moved");

    transport.stop().await;
}

#[tokio::test]
async fn test_failed_open_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_body_string("no token"))
        .mount(&server)
        .await;

    let url = Url::parse(&format!("{}/sse", server.uri())).unwrap();
    let transport = SseTransport::new("sse-test", url, HeaderMap::new()).unwrap();
    let (tx, _rx) = event_channel();

    match transport.start(tx).await {
        Err(TransportError::Status { status, body }) => {
            assert_eq!(status, 401);
            assert_eq!(body, "no token");
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn test_send_before_start_fails() {
    let transport = SseTransport::new(
        "sse-test",
        Url::parse("http://127.0.0.1:9/sse").unwrap(),
        HeaderMap::new(),
    )
    .unwrap();

    assert!(matches!(
        transport.send(JsonRpcMessage::notification("notifications/initialized", None)).await,
        Err(TransportError::NotConnected)
    ));
}
