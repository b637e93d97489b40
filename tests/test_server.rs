//! End-to-end tests of the server half, asserting on raw wire bytes.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use janus::{
    ContentGenerator, DataSource, FileInfo, Http, HttpError, HttpSink, ListingItem, Request,
};

fn demo_generator() -> Arc<dyn ContentGenerator> {
    Arc::new(|request: &Request, sink: HttpSink| {
        match request.uri.as_str() {
            "/hello" => sink.content("hello", FileInfo::new("text/plain", 1_700_000_000)),
            "/a" => sink.content("A", FileInfo::new("text/plain", -1)),
            "/b" => sink.content("BB", FileInfo::new("text/plain", -1)),
            "/c" => sink.content("CCC", FileInfo::new("text/plain", -1)),
            "/echo-x" => {
                let value = request.header("X-Long").unwrap_or("").to_string();
                sink.content(value.into_bytes(), FileInfo::new("text/plain", -1));
            }
            "/listing" => {
                sink.listing(&[
                    ListingItem::file("zebra.txt"),
                    ListingItem::dir("archive"),
                    ListingItem::file("alpha.txt"),
                ]);
            }
            "/elsewhere" => sink.see_other("/hello"),
            "/missing" => return Err(HttpError::NotFound("missing".to_string())),
            "/broken" => return Err(HttpError::Unavailable("backend is gone".to_string())),
            uri => return Err(HttpError::NotFound(format!("no {}", uri))),
        }
        Ok(())
    })
}

fn start_engine() -> (Http, SocketAddr) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let engine = Http::new();
    let addr = engine
        .listen("127.0.0.1:0".parse().unwrap(), demo_generator())
        .unwrap();
    engine.start_server(2).unwrap();
    (engine, addr)
}

/// Splits a stream of HTTP responses into (head, body) pairs.
struct ResponseReader {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl ResponseReader {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    async fn next(&mut self, head_only: bool) -> (String, Vec<u8>) {
        loop {
            if let Some(pos) = find_blank_line(&self.buf) {
                let head = String::from_utf8(self.buf[..pos].to_vec()).unwrap();
                self.buf.drain(..pos + 4);

                let length = if head_only {
                    0
                } else {
                    header_value(&head, "Content-Length")
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0)
                };
                while self.buf.len() < length {
                    self.read_more().await.expect("body cut short");
                }
                let body: Vec<u8> = self.buf.drain(..length).collect();
                return (head, body);
            }
            self.read_more().await.expect("response cut short");
        }
    }

    async fn read_more(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    async fn expect_eof(&mut self) {
        assert!(
            self.buf.is_empty(),
            "unexpected trailing bytes: {:?}",
            self.buf
        );
        let mut chunk = [0u8; 64];
        let n = self.stream.read(&mut chunk).await.unwrap_or(0);
        assert_eq!(n, 0, "expected the server to close the connection");
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().skip(1).find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.trim()
            .eq_ignore_ascii_case(name)
            .then(|| v.trim().to_string())
    })
}

fn status_of(head: &str) -> &str {
    head.lines().next().unwrap_or("")
}

async fn connect(addr: SocketAddr) -> ResponseReader {
    ResponseReader::new(TcpStream::connect(addr).await.unwrap())
}

#[tokio::test]
async fn test_get_in_memory_body() {
    let (engine, addr) = start_engine();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let (head, body) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 200 OK");
    assert_eq!(body, b"hello");
    assert_eq!(header_value(&head, "Content-Length").unwrap(), "5");
    assert_eq!(header_value(&head, "Content-Type").unwrap(), "text/plain");
    assert_eq!(
        header_value(&head, "Last-Modified").unwrap(),
        "Tue, 14 Nov 2023 22:13:20 GMT"
    );
    assert!(header_value(&head, "Date").is_some());
    assert!(header_value(&head, "Server").unwrap().starts_with("janus/"));
    assert!(header_value(&head, "Connection").is_none());

    engine.stop();
}

#[tokio::test]
async fn test_head_suppresses_body() {
    let (engine, addr) = start_engine();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"HEAD /hello HTTP/1.1\r\n\r\nGET /hello HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let (head, _) = conn.next(true).await;
    assert_eq!(status_of(&head), "HTTP/1.1 200 OK");
    assert_eq!(header_value(&head, "Content-Length").unwrap(), "5");

    // the next bytes on the wire must be the second response, not a body
    let (head, body) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 200 OK");
    assert_eq!(body, b"hello");

    engine.stop();
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let (engine, addr) = start_engine();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(
            b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\nGET /c HTTP/1.1\r\n\r\n",
        )
        .await
        .unwrap();

    let (head, body) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 200 OK");
    assert_eq!(body, b"A");
    let (head, body) = conn.next(false).await;
    assert_eq!(header_value(&head, "Content-Length").unwrap(), "2");
    assert_eq!(body, b"BB");
    let (_, body) = conn.next(false).await;
    assert_eq!(body, b"CCC");

    engine.stop();
}

#[tokio::test]
async fn test_generator_error_maps_to_status() {
    let (engine, addr) = start_engine();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"GET /missing HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let (head, body) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 404 Not Found");
    assert!(String::from_utf8(body).unwrap().contains("404 Not Found"));
    assert_eq!(
        header_value(&head, "Content-Type").unwrap(),
        "text/html; charset=utf-8"
    );

    // error responses keep the connection alive
    conn.stream
        .write_all(b"GET /hello HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 200 OK");
    assert_eq!(body, b"hello");

    engine.stop();
}

#[tokio::test]
async fn test_see_other_sends_302_with_location() {
    let (engine, addr) = start_engine();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"GET /elsewhere HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let (head, body) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 302 Found");
    assert_eq!(header_value(&head, "Location").unwrap(), "/hello");
    assert_eq!(header_value(&head, "Content-Length").unwrap(), "0");
    assert!(body.is_empty());

    engine.stop();
}

#[tokio::test]
async fn test_unavailable_maps_to_503() {
    let (engine, addr) = start_engine();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"GET /broken HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let (head, body) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 503 Service Unavailable");
    assert!(String::from_utf8(body).unwrap().contains("503"));

    engine.stop();
}

#[tokio::test]
async fn test_unknown_method_yields_405() {
    let (engine, addr) = start_engine();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"BREW /hello HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let (head, body) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 405 Not Allowed");
    assert!(String::from_utf8(body)
        .unwrap()
        .contains("405 Method Not Allowed"));

    // 405 does not terminate the connection
    conn.stream
        .write_all(b"GET /hello HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 200 OK");

    engine.stop();
}

#[tokio::test]
async fn test_malformed_request_line_yields_400_and_close() {
    let (engine, addr) = start_engine();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"GET-NO-SPACES\r\n\r\n")
        .await
        .unwrap();

    let (head, body) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 400 Bad Request");
    assert_eq!(header_value(&head, "Connection").unwrap(), "close");
    assert!(String::from_utf8(body).unwrap().contains("400 Bad Request"));
    conn.expect_eof().await;

    engine.stop();
}

#[tokio::test]
async fn test_header_without_colon_yields_400() {
    let (engine, addr) = start_engine();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"GET /hello HTTP/1.1\r\nBrokenHeader\r\n\r\n")
        .await
        .unwrap();

    let (head, _) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 400 Bad Request");
    conn.expect_eof().await;

    engine.stop();
}

#[tokio::test]
async fn test_folded_header_without_predecessor_yields_400() {
    let (engine, addr) = start_engine();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"GET /hello HTTP/1.1\r\n continuation\r\n\r\n")
        .await
        .unwrap();

    let (head, _) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 400 Bad Request");
    conn.expect_eof().await;

    engine.stop();
}

#[tokio::test]
async fn test_folded_header_is_appended() {
    let (engine, addr) = start_engine();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"GET /echo-x HTTP/1.1\r\nX-Long: part1\r\n\tpart2\r\n\r\n")
        .await
        .unwrap();

    let (_, body) = conn.next(false).await;
    assert_eq!(body, b"part1 part2");

    engine.stop();
}

#[tokio::test]
async fn test_leading_blank_line_is_skipped() {
    let (engine, addr) = start_engine();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"\r\nGET /hello HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let (head, body) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 200 OK");
    assert_eq!(body, b"hello");

    engine.stop();
}

#[tokio::test]
async fn test_listing_is_sorted_html() {
    let (engine, addr) = start_engine();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"GET /listing HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let (head, body) = conn.next(false).await;
    assert_eq!(
        header_value(&head, "Content-Type").unwrap(),
        "text/html; charset=utf-8"
    );

    let html = String::from_utf8(body).unwrap();
    let up = html.find("<a href=\"../\">../</a>").unwrap();
    let alpha = html.find("<a href=\"alpha.txt\">alpha.txt</a>").unwrap();
    let archive = html.find("<a href=\"archive/\">archive/</a>").unwrap();
    let zebra = html.find("<a href=\"zebra.txt\">zebra.txt</a>").unwrap();
    assert!(up < alpha && alpha < archive && archive < zebra);
    assert!(html.contains("Index of /listing"));

    engine.stop();
}

struct StaticSource {
    data: Vec<u8>,
    closed: Arc<AtomicBool>,
}

impl DataSource for StaticSource {
    fn stat(&self) -> FileInfo {
        FileInfo::new("application/x-blob", 1_700_000_000)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    fn name(&self) -> &str {
        "static"
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn stream_engine(size: usize) -> (Http, SocketAddr, Arc<AtomicBool>) {
    let closed = Arc::new(AtomicBool::new(false));
    let flag = closed.clone();
    let generator: Arc<dyn ContentGenerator> =
        Arc::new(move |_request: &Request, sink: HttpSink| {
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            sink.content_source(Box::new(StaticSource {
                data,
                closed: flag.clone(),
            }));
            Ok(())
        });

    let engine = Http::new();
    let addr = engine
        .listen("127.0.0.1:0".parse().unwrap(), generator)
        .unwrap();
    engine.start_server(2).unwrap();
    (engine, addr, closed)
}

#[tokio::test]
async fn test_streamed_response_spans_chunks() {
    // larger than two 64 KiB send chunks
    let size = 150_000;
    let (engine, addr, closed) = stream_engine(size);

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"GET /blob HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let (head, body) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 200 OK");
    assert_eq!(
        header_value(&head, "Content-Length").unwrap(),
        size.to_string()
    );
    assert_eq!(
        header_value(&head, "Content-Type").unwrap(),
        "application/x-blob"
    );
    assert_eq!(body.len(), size);
    assert!(body.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));

    // the source is closed right after the last chunk is handed to the
    // socket, which may trail the client's read by a moment
    for _ in 0..100 {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(closed.load(Ordering::SeqCst), "source must be closed");

    engine.stop();
}

#[tokio::test]
async fn test_head_on_streamed_response_sends_headers_only() {
    let size = 70_000;
    let (engine, addr, _closed) = stream_engine(size);

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"HEAD /blob HTTP/1.1\r\n\r\nHEAD /blob HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let (head, _) = conn.next(true).await;
    assert_eq!(
        header_value(&head, "Content-Length").unwrap(),
        size.to_string()
    );
    // a leaked body would derail the second response
    let (head, _) = conn.next(true).await;
    assert_eq!(status_of(&head), "HTTP/1.1 200 OK");

    engine.stop();
}

#[tokio::test]
async fn test_server_header_override() {
    let engine = Http::new();
    let addr = engine
        .listen("127.0.0.1:0".parse().unwrap(), demo_generator())
        .unwrap();
    engine.server_header("unit/1.0");
    engine.start_server(1).unwrap();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"GET /hello HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let (head, _) = conn.next(false).await;
    assert_eq!(header_value(&head, "Server").unwrap(), "unit/1.0");

    engine.stop();
}

#[tokio::test]
async fn test_serve_starts_in_one_call() {
    let (engine, addr) =
        Http::serve("127.0.0.1:0".parse().unwrap(), 1, demo_generator()).unwrap();
    assert!(engine.server_handle().is_some());

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"GET /hello HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 200 OK");
    assert_eq!(body, b"hello");

    engine.stop();
    assert!(engine.server_handle().is_none());
}

#[tokio::test]
async fn test_start_twice_is_an_error() {
    let (engine, _addr) = start_engine();
    assert!(engine.start_server(1).is_err());
    engine.stop();
}

#[tokio::test]
async fn test_stop_and_restart_behaves_like_fresh() {
    let (engine, addr) = start_engine();
    engine.stop();

    // give the aborted accept loop a moment to release the socket
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(
        TcpStream::connect(addr).await.is_err(),
        "stopped engine must refuse connections"
    );

    // restarting after a stop works like a fresh engine
    let addr = engine
        .listen("127.0.0.1:0".parse().unwrap(), demo_generator())
        .unwrap();
    engine.start_server(1).unwrap();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"GET /hello HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = conn.next(false).await;
    assert_eq!(status_of(&head), "HTTP/1.1 200 OK");
    assert_eq!(body, b"hello");

    engine.stop();
}

#[tokio::test]
async fn test_aborter_fires_when_the_client_disconnects() {
    let aborted = Arc::new(AtomicBool::new(false));
    let saw_abort = Arc::new(AtomicBool::new(false));

    let aborter_flag = aborted.clone();
    let poll_flag = saw_abort.clone();
    let generator: Arc<dyn ContentGenerator> =
        Arc::new(move |_request: &Request, sink: HttpSink| {
            let flag = aborter_flag.clone();
            sink.set_aborter(move || flag.store(true, Ordering::SeqCst));

            // park the sink on another thread; no response is produced, the
            // worker just polls for cancellation
            let parked = sink.clone();
            let seen = poll_flag.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    if parked.check_aborted().is_err() {
                        seen.store(true, Ordering::SeqCst);
                        return;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(25));
                }
            });
            Ok(())
        });

    let engine = Http::new();
    let addr = engine
        .listen("127.0.0.1:0".parse().unwrap(), generator)
        .unwrap();
    engine.start_server(1).unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /slow HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    // let the request reach the generator, then walk away
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    drop(stream);

    for _ in 0..100 {
        if aborted.load(Ordering::SeqCst) && saw_abort.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(aborted.load(Ordering::SeqCst), "aborter must fire");
    assert!(
        saw_abort.load(Ordering::SeqCst),
        "check_aborted must report the closed connection"
    );

    engine.stop();
}

#[tokio::test]
async fn test_header_count_matches_line_count() {
    // every parsed header line lands in the header list
    let generator: Arc<dyn ContentGenerator> =
        Arc::new(|request: &Request, sink: HttpSink| {
            let summary = format!("{}:{}", request.lines, request.headers.len());
            sink.content(summary.into_bytes(), FileInfo::new("text/plain", -1));
            Ok(())
        });
    let engine = Http::new();
    let addr = engine
        .listen("127.0.0.1:0".parse().unwrap(), generator)
        .unwrap();
    engine.start_server(1).unwrap();

    let mut conn = connect(addr).await;
    conn.stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nAccept: */*\r\nX-One: 1\r\n\r\n")
        .await
        .unwrap();
    let (_, body) = conn.next(false).await;
    assert_eq!(body, b"4:3");

    conn.stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let (_, body) = conn.next(false).await;
    assert_eq!(body, b"1:0");

    engine.stop();
}
