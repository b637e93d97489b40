//! A single outbound HTTP/1.1 transfer.
//!
//! Transfers are constructed inside a worker's reactor and never leave it.
//! Every socket a transfer opens goes through the worker's descriptor table,
//! whose entries are erased exactly when the socket is released; the table
//! must balance out by the end of each fetch.
//!
//! The response header block is assembled line by line: a line of two bytes
//! or fewer ends the headers, a line starting with whitespace folds into the
//! previous header, and non-whitespace lines without a colon are discarded.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use url::Url;

use crate::client::dns::DnsCache;
use crate::client::{ClientSink, FetchOptions};
use crate::error::HttpError;
use crate::http::cache_control::parse_cache_control;
use crate::http::date::{format_http_date, parse_http_date};
use crate::http::types::{FileInfo, CACHE_UNSPECIFIED};

const MAX_REDIRECTS: usize = 10;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const MAX_LINE: usize = 16 * 1024;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 6.3; rv:36.0) Gecko/20100101 Firefox/36.0";

/// Descriptor-keyed table of sockets currently owned by transfers of one
/// worker. One entry per live socket; entries leave on release, never earlier.
pub(crate) struct SocketTable {
    open: HashMap<RawFd, SocketAddr>,
    opened: u64,
    closed: u64,
}

impl SocketTable {
    pub(crate) fn new() -> Self {
        Self {
            open: HashMap::new(),
            opened: 0,
            closed: 0,
        }
    }

    fn adopt(&mut self, fd: RawFd, peer: SocketAddr) {
        self.opened += 1;
        self.open.insert(fd, peer);
    }

    fn release(&mut self, fd: RawFd) {
        if self.open.remove(&fd).is_some() {
            self.closed += 1;
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.open.len()
    }

    pub(crate) fn opened(&self) -> u64 {
        self.opened
    }

    pub(crate) fn closed(&self) -> u64 {
        self.closed
    }
}

/// Worker-local context shared by that worker's transfers only.
pub(crate) struct WorkerCtx {
    pub(crate) id: usize,
    pub(crate) dns: Arc<DnsCache>,
    pub(crate) sockets: RefCell<SocketTable>,
}

/// Erases the table entry when the transfer lets go of its socket.
struct SocketGuard {
    fd: RawFd,
    ctx: Rc<WorkerCtx>,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.ctx.sockets.borrow_mut().release(self.fd);
    }
}

/// One fetch as posted to a worker.
pub(crate) struct FetchTask {
    pub(crate) location: String,
    pub(crate) sink: Box<dyn ClientSink>,
    pub(crate) options: FetchOptions,
}

struct TransferResult {
    status: u16,
    effective_url: String,
    content_type: Option<String>,
    last_modified: i64,
    expires: i64,
    body: Bytes,
    redirect_to: Option<String>,
}

#[derive(Default)]
struct HeaderState {
    content_type: Option<String>,
    last_modified: i64,
    max_age: Option<i64>,
    expires: Option<i64>,
    location: Option<String>,
    content_length: Option<usize>,
    chunked: bool,
}

/// Runs one fetch to completion and settles its sink.
pub(crate) async fn run(task: FetchTask, ctx: Rc<WorkerCtx>) {
    let FetchTask {
        location,
        sink,
        options,
    } = task;

    let timeout = if options.timeout_ms > 0 {
        options.timeout_ms as u64
    } else {
        DEFAULT_TIMEOUT_MS
    };

    let result = match tokio::time::timeout(
        Duration::from_millis(timeout),
        perform(&location, &options, &ctx),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(HttpError::Transport(format!(
            "transfer of <{}> timed out",
            location
        ))),
    };

    match result {
        Ok(result) => deliver(result, sink),
        Err(err) => {
            tracing::debug!(worker = ctx.id, location = %location, error = %err, "transfer failed");
            sink.error(err);
        }
    }
}

async fn perform(
    location: &str,
    options: &FetchOptions,
    ctx: &Rc<WorkerCtx>,
) -> Result<TransferResult, HttpError> {
    let mut url = Url::parse(location)
        .map_err(|e| HttpError::Transport(format!("invalid url <{}>: {}", location, e)))?;

    for _ in 0..=MAX_REDIRECTS {
        let result = attempt(&url, options, ctx).await?;

        if options.follow_redirects {
            if let Some(next) = result.redirect_to.as_ref() {
                url = url
                    .join(next)
                    .map_err(|e| HttpError::Transport(format!("invalid redirect <{}>: {}", next, e)))?;
                tracing::debug!(worker = ctx.id, url = %url, "following redirect");
                continue;
            }
        }
        return Ok(result);
    }

    Err(HttpError::Transport(format!(
        "too many redirects fetching <{}>",
        location
    )))
}

async fn attempt(
    url: &Url,
    options: &FetchOptions,
    ctx: &Rc<WorkerCtx>,
) -> Result<TransferResult, HttpError> {
    if url.scheme() != "http" {
        return Err(HttpError::Transport(format!(
            "unsupported scheme <{}> in <{}>",
            url.scheme(),
            url
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| HttpError::Transport(format!("url <{}> has no host", url)))?;
    let port = url.port().unwrap_or(80);

    let endpoints = ctx.dns.resolve(host, port).await?;
    let (stream, peer) = connect_any(&endpoints).await?;
    let _guard = SocketGuard {
        fd: stream.as_raw_fd(),
        ctx: ctx.clone(),
    };
    ctx.sockets.borrow_mut().adopt(stream.as_raw_fd(), peer);

    let mut stream = BufReader::new(stream);
    write_request(&mut stream, url, host, port, options).await?;

    let status = read_status_line(&mut stream).await?;

    let mut headers = HeaderState {
        last_modified: -1,
        ..HeaderState::default()
    };
    read_headers(&mut stream, &mut headers).await?;

    let body = if status == 304 || status == 204 || status < 200 {
        Vec::new()
    } else if headers.chunked {
        read_chunked_body(&mut stream).await?
    } else if let Some(length) = headers.content_length {
        read_sized_body(&mut stream, length).await?
    } else {
        read_body_to_close(&mut stream).await?
    };

    let redirect_to = if (300..400).contains(&status) && status != 304 {
        headers.location.clone()
    } else {
        None
    };

    Ok(TransferResult {
        status,
        effective_url: url.to_string(),
        content_type: headers.content_type,
        last_modified: headers.last_modified,
        expires: headers
            .max_age
            .or(headers.expires)
            .unwrap_or(CACHE_UNSPECIFIED),
        body: Bytes::from(body),
        redirect_to,
    })
}

/// Maps the finished transfer onto the sink per response class.
fn deliver(result: TransferResult, sink: Box<dyn ClientSink>) {
    match result.status {
        200..=299 => {
            let info = FileInfo {
                content_type: result
                    .content_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                last_modified: result.last_modified,
                expires: result.expires,
            };
            sink.content(result.body, info);
        }
        304 => sink.not_modified(),
        300..=399 => sink.see_other(result.redirect_to.unwrap_or(result.effective_url)),
        404 => sink.error(HttpError::NotFound("Not Found".to_string())),
        405 => sink.error(HttpError::NotAllowed("Method Not Allowed".to_string())),
        503 => sink.error(HttpError::Unavailable("Service Not Available".to_string())),
        code => sink.error(HttpError::InternalError(format!("Server error {}.", code))),
    }
}

async fn connect_any(endpoints: &[SocketAddr]) -> Result<(TcpStream, SocketAddr), HttpError> {
    let mut last = None;
    for &endpoint in endpoints {
        match TcpStream::connect(endpoint).await {
            Ok(stream) => return Ok((stream, endpoint)),
            Err(err) => last = Some(err),
        }
    }
    Err(HttpError::Transport(match last {
        Some(err) => format!("connect failed: {}", err),
        None => "connect failed: no endpoints".to_string(),
    }))
}

async fn write_request(
    stream: &mut BufReader<TcpStream>,
    url: &Url,
    host: &str,
    port: u16,
    options: &FetchOptions,
) -> Result<(), HttpError> {
    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let mut head = String::with_capacity(256);
    head.push_str(&format!("GET {} HTTP/1.1\r\n", target));
    if port == 80 {
        head.push_str(&format!("Host: {}\r\n", host));
    } else {
        head.push_str(&format!("Host: {}:{}\r\n", host, port));
    }
    let user_agent = if options.user_agent.is_empty() {
        DEFAULT_USER_AGENT
    } else {
        &options.user_agent
    };
    head.push_str(&format!("User-Agent: {}\r\n", user_agent));
    head.push_str("Accept: */*\r\n");
    if options.last_modified >= 0 {
        head.push_str(&format!(
            "If-Modified-Since: {}\r\n",
            format_http_date(options.last_modified)
        ));
    }
    if !options.reuse {
        head.push_str("Connection: close\r\n");
    }
    head.push_str("\r\n");

    stream
        .write_all(head.as_bytes())
        .await
        .map_err(|e| HttpError::Transport(format!("request write failed: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| HttpError::Transport(format!("request write failed: {}", e)))
}

async fn read_status_line(stream: &mut BufReader<TcpStream>) -> Result<u16, HttpError> {
    let line = read_raw_line(stream).await?;
    let text = String::from_utf8_lossy(&line);
    let text = text.trim_end();

    let mut parts = text.split_whitespace();
    let version = parts.next().unwrap_or("");
    let code = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") {
        return Err(HttpError::Transport(format!(
            "malformed status line <{}>",
            text
        )));
    }
    code.parse::<u16>()
        .map_err(|_| HttpError::Transport(format!("malformed status line <{}>", text)))
}

async fn read_headers(
    stream: &mut BufReader<TcpStream>,
    state: &mut HeaderState,
) -> Result<(), HttpError> {
    let mut pending: Option<(String, String)> = None;

    loop {
        let raw = read_raw_line(stream).await?;
        if raw.len() <= 2 {
            // end of headers
            if let Some((name, value)) = pending.take() {
                process_header(state, &name, &value);
            }
            return Ok(());
        }

        let text = String::from_utf8_lossy(&raw);
        let text = text.trim_end_matches(['\r', '\n']);

        if text.starts_with(' ') || text.starts_with('\t') {
            // folded continuation of the previous header
            if let Some((_, value)) = pending.as_mut() {
                value.push(' ');
                value.push_str(text.trim());
            }
        } else if let Some((name, value)) = text.split_once(':') {
            if let Some((name, value)) = pending.take() {
                process_header(state, &name, &value);
            }
            pending = Some((name.trim().to_string(), value.trim().to_string()));
        }
        // anything else is noise and gets dropped
    }
}

fn process_header(state: &mut HeaderState, name: &str, value: &str) {
    if name.eq_ignore_ascii_case("Content-Type") {
        state.content_type = Some(value.to_string());
    } else if name.eq_ignore_ascii_case("Last-Modified") {
        state.last_modified = parse_http_date(value).unwrap_or(-1);
    } else if name.eq_ignore_ascii_case("Cache-Control") {
        if let Some(age) = parse_cache_control(value) {
            state.max_age = Some(age);
        }
    } else if name.eq_ignore_ascii_case("Expires") {
        state.expires = parse_http_date(value);
    } else if name.eq_ignore_ascii_case("Location") {
        state.location = Some(value.to_string());
    } else if name.eq_ignore_ascii_case("Content-Length") {
        state.content_length = value.parse().ok();
    } else if name.eq_ignore_ascii_case("Transfer-Encoding") {
        if value.to_ascii_lowercase().contains("chunked") {
            state.chunked = true;
        }
    }
}

/// Reads one raw header line including its terminator.
async fn read_raw_line(stream: &mut BufReader<TcpStream>) -> Result<Vec<u8>, HttpError> {
    let mut line = Vec::with_capacity(128);
    let mut limited = (&mut *stream).take((MAX_LINE + 2) as u64);

    let n = limited
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| HttpError::Transport(format!("response read failed: {}", e)))?;
    if n == 0 {
        return Err(HttpError::Transport(
            "connection closed while reading response".to_string(),
        ));
    }
    if line.last() != Some(&b'\n') {
        return Err(HttpError::Transport("response line too long".to_string()));
    }
    Ok(line)
}

async fn read_sized_body(
    stream: &mut BufReader<TcpStream>,
    length: usize,
) -> Result<Vec<u8>, HttpError> {
    let mut body = vec![0u8; length];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| HttpError::Transport(format!("body read failed: {}", e)))?;
    Ok(body)
}

async fn read_body_to_close(stream: &mut BufReader<TcpStream>) -> Result<Vec<u8>, HttpError> {
    let mut body = Vec::new();
    stream
        .read_to_end(&mut body)
        .await
        .map_err(|e| HttpError::Transport(format!("body read failed: {}", e)))?;
    Ok(body)
}

async fn read_chunked_body(stream: &mut BufReader<TcpStream>) -> Result<Vec<u8>, HttpError> {
    let mut body = Vec::new();

    loop {
        let line = read_raw_line(stream).await?;
        let text = String::from_utf8_lossy(&line);
        let size_token = text.trim_end().split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_token, 16)
            .map_err(|_| HttpError::Transport(format!("malformed chunk size <{}>", size_token)))?;

        if size == 0 {
            // trailers, if any, run until a blank line
            loop {
                let trailer = read_raw_line(stream).await?;
                if trailer.len() <= 2 {
                    return Ok(body);
                }
            }
        }

        let start = body.len();
        body.resize(start + size, 0);
        stream
            .read_exact(&mut body[start..])
            .await
            .map_err(|e| HttpError::Transport(format!("chunk read failed: {}", e)))?;

        let crlf = read_raw_line(stream).await?;
        if crlf.len() > 2 {
            return Err(HttpError::Transport("malformed chunk terminator".to_string()));
        }
    }
}
