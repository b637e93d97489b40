//! Per-connection request pipeline.
//!
//! Each accepted socket is owned by a single task actor, which serializes
//! everything that happens on the connection (the strand of the design).
//! A companion parser task reads request lines and headers and feeds an
//! ordered queue; as soon as one request goes `Ready` the parser moves on to
//! the next, so pipelined requests queue up while earlier ones are still
//! being answered. Responses always leave in arrival order.
//!
//! Connection states:
//!
//! - `Ready`: idle, willing to dispatch the next queued request
//! - `Busy`: a generator owns the current request's sink
//! - `BusyClose`: the in-flight response demands termination after send
//! - `Closed`: socket gone; sinks observe this through `finished()`

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use crate::engine::EngineCore;
use crate::error::HttpError;
use crate::http::date::format_http_date;
use crate::http::types::{Header, Request, RequestState, Response, StatusCode};
use crate::server::sink::{error_body, DataSource, HttpSink, Outcome};
use crate::server::ContentGenerator;

/// Streamed responses are sent in chunks of this size.
const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on a single request or header line.
const MAX_LINE: usize = 8 * 1024;

const STATE_READY: u8 = 0;
const STATE_BUSY: u8 = 1;
const STATE_BUSY_CLOSE: u8 = 2;
const STATE_CLOSED: u8 = 3;

static ID_GENERATOR: AtomicUsize = AtomicUsize::new(0);

pub(crate) type AbortCallback = Box<dyn FnOnce() + Send>;

/// Connection state visible outside the actor: the engine registry pokes
/// `request_close`, sinks poll `finished` and install the aborter.
pub(crate) struct ConnShared {
    pub(crate) id: usize,
    state: AtomicU8,
    aborter: Mutex<Option<AbortCallback>>,
    close: Notify,
}

impl ConnShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ID_GENERATOR.fetch_add(1, Ordering::Relaxed) + 1,
            state: AtomicU8::new(STATE_READY),
            aborter: Mutex::new(None),
            close: Notify::new(),
        })
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::SeqCst);
    }

    fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }

    /// True once the connection is doomed: no further response may start.
    pub(crate) fn finished(&self) -> bool {
        matches!(self.state(), STATE_BUSY_CLOSE | STATE_CLOSED)
    }

    pub(crate) fn valid(&self) -> bool {
        !self.finished()
    }

    pub(crate) fn set_aborter(&self, cb: AbortCallback) {
        *self.aborter.lock().unwrap() = Some(cb);
    }

    /// Runs the installed abort hook at most once, outside the lock.
    fn fire_aborter(&self) {
        let cb = self.aborter.lock().unwrap().take();
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Asks the actor to wind the connection down. Safe from any thread;
    /// the permit is retained if the actor is between suspension points.
    pub(crate) fn request_close(&self) {
        self.close.notify_one();
    }
}

/// Drives one accepted connection to completion.
pub(crate) async fn run(
    stream: TcpStream,
    shared: Arc<ConnShared>,
    engine: Arc<EngineCore>,
    generator: Arc<dyn ContentGenerator>,
) {
    let id = shared.id;
    tracing::debug!(conn = id, "connection opened");

    let (read_half, mut write_half) = stream.into_split();
    let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Request>();
    let parser = tokio::spawn(parse_requests(read_half, queue_tx, shared.clone()));

    loop {
        let request = tokio::select! {
            _ = shared.close.notified() => break,
            req = queue_rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };

        match request.state {
            RequestState::Ready => {
                tracing::info!(
                    conn = id,
                    "HTTP \"{} {} {}\"",
                    request.method,
                    request.uri,
                    request.version
                );
                shared.set_state(STATE_BUSY);

                let (sink, reply) = HttpSink::new(shared.clone(), request.uri.clone());
                dispatch(&request, sink, generator.as_ref());

                let outcome = tokio::select! {
                    _ = shared.close.notified() => break,
                    out = reply => out.unwrap_or_else(|_| {
                        Outcome::Error(HttpError::InternalError(
                            "content generator produced no response".to_string(),
                        ))
                    }),
                };

                if emit(&mut write_half, &shared, &engine, &request, outcome)
                    .await
                    .is_err()
                {
                    break;
                }
                if shared.state() == STATE_BUSY_CLOSE {
                    break;
                }
                shared.set_state(STATE_READY);
            }

            RequestState::Broken => {
                let mut response = Response::new(StatusCode::BadRequest)
                    .header("Content-Type", "text/html; charset=utf-8");
                response.reason = "Bad request".to_string();
                response.close = true;

                let body = Bytes::from_static(error_body(StatusCode::BadRequest).as_bytes());
                let _ = send_buffer(&mut write_half, &shared, &engine, &request, response, body)
                    .await;
                break;
            }

            // the parser only queues terminal states
            RequestState::Reading => continue,
        }
    }

    shared.set_state(STATE_CLOSED);
    parser.abort();
    shared.fire_aborter();
    engine.remove_connection(id);
    tracing::debug!(conn = id, "connection closed");
}

/// Hands the request to the content generator, or raises the 405/500 paths.
fn dispatch(request: &Request, sink: HttpSink, generator: &dyn ContentGenerator) {
    if request.method == "GET" || request.method == "HEAD" {
        match catch_unwind(AssertUnwindSafe(|| generator.generate(request, sink.clone()))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => sink.error(err),
            Err(_) => {
                sink.error(HttpError::InternalError(
                    "content generator panicked".to_string(),
                ));
            }
        }
    } else {
        sink.error(HttpError::NotAllowed(format!(
            "Method {} is not supported.",
            request.method
        )));
    }
}

async fn emit(
    write_half: &mut OwnedWriteHalf,
    shared: &Arc<ConnShared>,
    engine: &Arc<EngineCore>,
    request: &Request,
    outcome: Outcome,
) -> Result<(), ()> {
    match outcome {
        Outcome::Content { data, info } => {
            let response = Response::new(StatusCode::Ok)
                .header("Content-Type", info.content_type.clone())
                .header("Last-Modified", info.last_modified_header());
            send_buffer(write_half, shared, engine, request, response, data).await
        }

        Outcome::Stream(source) => {
            send_stream(write_half, shared, engine, request, source).await
        }

        Outcome::SeeOther(url) => {
            let response = Response::new(StatusCode::Found).header("Location", url);
            send_buffer(write_half, shared, engine, request, response, Bytes::new()).await
        }

        Outcome::Error(err) => {
            let code = match err {
                HttpError::NotFound(_) => StatusCode::NotFound,
                HttpError::NotAllowed(_) => StatusCode::NotAllowed,
                HttpError::Unavailable(_) => StatusCode::ServiceUnavailable,
                _ => StatusCode::InternalServerError,
            };
            tracing::debug!(conn = shared.id, status = code.as_u16(), "sending http error");

            let mut response =
                Response::new(code).header("Content-Type", "text/html; charset=utf-8");
            response.reason = err.to_string();

            let body = Bytes::from_static(error_body(code).as_bytes());
            send_buffer(write_half, shared, engine, request, response, body).await
        }
    }
}

fn response_head(
    engine: &Arc<EngineCore>,
    request: &Request,
    response: &Response,
    extra: &[Header],
    content_length: u64,
) -> String {
    let mut head = String::with_capacity(256);
    head.push_str(&format!(
        "{} {} {}\r\n",
        request.version,
        response.code.as_u16(),
        response.code.reason_phrase()
    ));
    head.push_str(&format!("Date: {}\r\n", format_http_date(-1)));
    head.push_str(&format!("Server: {}\r\n", engine.server_header_value()));
    for hdr in response.headers.iter().chain(extra.iter()) {
        head.push_str(&format!("{}: {}\r\n", hdr.name, hdr.value));
    }
    head.push_str(&format!("Content-Length: {}\r\n", content_length));
    if response.close {
        head.push_str("Connection: close\r\n");
    }
    head.push_str("\r\n");
    head
}

async fn send_buffer(
    write_half: &mut OwnedWriteHalf,
    shared: &Arc<ConnShared>,
    engine: &Arc<EngineCore>,
    request: &Request,
    response: Response,
    body: Bytes,
) -> Result<(), ()> {
    let head = response_head(engine, request, &response, &[], body.len() as u64);

    if response.close {
        shared.set_state(STATE_BUSY_CLOSE);
    }

    let mut total = head.len();
    let result = async {
        write_half.write_all(head.as_bytes()).await?;
        if !request.is_head() && !body.is_empty() {
            write_half.write_all(&body).await?;
            total += body.len();
        }
        write_half.flush().await
    }
    .await;

    match result {
        Ok(()) => {
            post_log(shared.id, request, &response, total);
            Ok(())
        }
        Err(err) => {
            tracing::debug!(conn = shared.id, error = %err, "send failed");
            Err(())
        }
    }
}

async fn send_stream(
    write_half: &mut OwnedWriteHalf,
    shared: &Arc<ConnShared>,
    engine: &Arc<EngineCore>,
    request: &Request,
    mut source: Box<dyn DataSource>,
) -> Result<(), ()> {
    let stat = source.stat();
    let size = source.size();
    let response = Response::new(StatusCode::Ok);
    let extra = [
        Header::new("Content-Type", stat.content_type.clone()),
        Header::new("Last-Modified", stat.last_modified_header()),
    ];
    let head = response_head(engine, request, &response, &extra, size);

    let mut total = head.len();
    if let Err(err) = write_half.write_all(head.as_bytes()).await {
        tracing::debug!(conn = shared.id, error = %err, "send failed");
        source.close();
        return Err(());
    }

    if !request.is_head() && size > 0 {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut offset = 0u64;
        let mut left = size;

        while left > 0 {
            let want = (left as usize).min(CHUNK_SIZE);
            let n = match source.read(&mut buf[..want], offset) {
                Ok(0) | Err(_) => {
                    tracing::warn!(
                        conn = shared.id,
                        source = source.name(),
                        "error while reading from data source"
                    );
                    source.close();
                    return Err(());
                }
                Ok(n) => n,
            };

            if let Err(err) = write_half.write_all(&buf[..n]).await {
                tracing::debug!(conn = shared.id, error = %err, "send failed");
                source.close();
                return Err(());
            }
            offset += n as u64;
            left -= n as u64;
            total += n;
        }
    }

    if write_half.flush().await.is_err() {
        source.close();
        return Err(());
    }

    source.close();
    post_log(shared.id, request, &response, total);
    Ok(())
}

fn post_log(id: usize, request: &Request, response: &Response, size: usize) {
    if response.code == StatusCode::Ok {
        tracing::info!(
            conn = id,
            size,
            "HTTP \"{} {} {}\" {}",
            request.method,
            request.uri,
            request.version,
            response.code.as_u16()
        );
    } else {
        tracing::info!(
            conn = id,
            size,
            reason = %response.reason,
            "HTTP \"{} {} {}\" {}",
            request.method,
            request.uri,
            request.version,
            response.code.as_u16()
        );
    }
}

/// Reads requests off the socket and queues them in arrival order.
///
/// Parsing is line-oriented: CRLF-terminated request line, CRLF-terminated
/// header lines, blank line terminator. A line starting with whitespace
/// continues the previous header's value. The first parse failure marks the
/// request broken and stops the parser; the actor then runs the 400 path.
async fn parse_requests(
    read_half: OwnedReadHalf,
    queue: mpsc::UnboundedSender<Request>,
    shared: Arc<ConnShared>,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::with_capacity(256);

    'requests: loop {
        let mut request = Request::new();

        // request line; leading blank lines are tolerated and skipped
        loop {
            if !read_line(&mut reader, &mut line, &shared).await {
                return;
            }
            if !line.is_empty() {
                break;
            }
        }

        request.lines = 1;
        if !parse_request_line(&line, &mut request) {
            request.make_broken();
            let _ = queue.send(request);
            return;
        }

        // header lines until the terminating blank line
        loop {
            if !read_line(&mut reader, &mut line, &shared).await {
                return;
            }

            if line.is_empty() {
                request.make_ready();
                let _ = queue.send(request);
                // immediately start reading the next pipelined request
                continue 'requests;
            }

            request.lines += 1;

            if line[0] == b' ' || line[0] == b'\t' {
                // folded continuation; rejected without a predecessor
                let folded = String::from_utf8_lossy(&line);
                match request.headers.last_mut() {
                    Some(header) => {
                        header.value.push(' ');
                        header.value.push_str(folded.trim());
                    }
                    None => {
                        request.make_broken();
                        let _ = queue.send(request);
                        return;
                    }
                }
            } else if let Some(pos) = line.iter().position(|&b| b == b':') {
                let name = String::from_utf8_lossy(&line[..pos]).trim().to_string();
                let value = String::from_utf8_lossy(&line[pos + 1..]).trim().to_string();
                request.headers.push(Header::new(name, value));
            } else {
                request.make_broken();
                let _ = queue.send(request);
                return;
            }
        }
    }
}

/// Reads one CRLF-terminated line, without the terminator. Returns `false`
/// on end-of-stream or a read error, after flagging the connection closed.
async fn read_line(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &mut Vec<u8>,
    shared: &Arc<ConnShared>,
) -> bool {
    line.clear();
    let mut limited = (&mut *reader).take((MAX_LINE + 2) as u64);

    match limited.read_until(b'\n', line).await {
        Ok(0) => {
            tracing::debug!(conn = shared.id, "peer closed connection");
            shared.request_close();
            false
        }
        Ok(_) => {
            if line.last() != Some(&b'\n') {
                tracing::warn!(conn = shared.id, "header line too long or truncated");
                shared.request_close();
                return false;
            }
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            true
        }
        Err(err) => {
            tracing::debug!(conn = shared.id, error = %err, "read failed");
            shared.request_close();
            false
        }
    }
}

/// `METHOD SP URI SP VERSION`, single spaces, no trailing garbage.
fn parse_request_line(line: &[u8], request: &mut Request) -> bool {
    let Ok(text) = std::str::from_utf8(line) else {
        return false;
    };
    let mut parts = text.split(' ');
    let (Some(method), Some(uri), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if method.is_empty() || uri.is_empty() || version.is_empty() {
        return false;
    }
    request.method = method.to_string();
    request.uri = uri.to_string();
    request.version = version.to_string();
    true
}
