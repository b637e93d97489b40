//! Response surface handed to content generators.
//!
//! An [`HttpSink`] is a cheap-to-clone handle bound to one request on one
//! connection. Exactly one terminal operation (`content`, `content_source`,
//! `see_other`, `listing` or `error`) takes effect; later terminal calls on
//! the same sink, or calls made after the connection went away, are swallowed.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::HttpError;
use crate::http::types::{FileInfo, StatusCode};
use crate::server::connection::{AbortCallback, ConnShared};

/// Pull-based byte source backing a streamed response.
///
/// The connection drains it in 64 KiB chunks and calls [`DataSource::close`]
/// when the response completes or the send fails partway.
pub trait DataSource: Send {
    /// Body metadata; emitted as `Content-Type` and `Last-Modified`.
    fn stat(&self) -> FileInfo;

    /// Total body size; emitted as `Content-Length`.
    fn size(&self) -> u64;

    /// Reads up to `buf.len()` bytes at `offset` into `buf`.
    fn read(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Diagnostic name used in logs.
    fn name(&self) -> &str {
        "unnamed"
    }

    fn close(&mut self) {}
}

/// Kind of a directory listing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ListingKind {
    File,
    Dir,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListingItem {
    pub name: String,
    pub kind: ListingKind,
}

impl ListingItem {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ListingKind::File,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ListingKind::Dir,
        }
    }
}

pub(crate) const ERROR_400: &str = "<html>\n<head><title>400 Bad Request</title></head>\n<body bgcolor=\"white\">\n<center><h1>400 Bad Request</h1></center>\n";

pub(crate) const ERROR_404: &str = "<html>\n<head><title>404 Not Found</title></head>\n<body bgcolor=\"white\">\n<center><h1>404 Not Found</h1></center>\n";

pub(crate) const ERROR_405: &str = "<html>\n<head><title>405 Method Not Allowed</title></head>\n<body bgcolor=\"white\">\n<center><h1>405 Method Not Allowed</h1></center>\n";

pub(crate) const ERROR_500: &str = "<html>\n<head><title>500 Internal Server Error</title></head>\n<body bgcolor=\"white\">\n<center><h1>500 Internal Server Error</h1></center>\n";

pub(crate) const ERROR_503: &str = "<html>\n<head><title>503 Service Temporarily Unavailable</title></head>\n<body bgcolor=\"white\">\n<center><h1>503 Service Temporarily Unavailable</h1></center>\n";

pub(crate) fn error_body(code: StatusCode) -> &'static str {
    match code {
        StatusCode::BadRequest => ERROR_400,
        StatusCode::NotFound => ERROR_404,
        StatusCode::NotAllowed => ERROR_405,
        StatusCode::ServiceUnavailable => ERROR_503,
        _ => ERROR_500,
    }
}

/// Renders a sorted directory index. Directories carry a trailing slash;
/// a `../` anchor always leads.
pub(crate) fn render_listing(path: &str, entries: &[ListingItem]) -> String {
    let mut sorted = entries.to_vec();
    sorted.sort();

    let mut out = String::with_capacity(256 + sorted.len() * 32);
    out.push_str("<html>\n<head><title>Index of ");
    out.push_str(path);
    out.push_str("</title></head>\n<body bgcolor=\"white\">\n<h1>Index of ");
    out.push_str(path);
    out.push_str("\n</h1><hr><pre><a href=\"../\">../</a>\n");

    for item in &sorted {
        match item.kind {
            ListingKind::File => {
                out.push_str(&format!("<a href=\"{0}\">{0}</a>\n", item.name));
            }
            ListingKind::Dir => {
                out.push_str(&format!("<a href=\"{0}/\">{0}/</a>\n", item.name));
            }
        }
    }

    out.push_str("</pre><hr></body>\n</html>\n");
    out
}

/// Terminal result a sink delivers back to its connection.
pub(crate) enum Outcome {
    Content { data: Bytes, info: FileInfo },
    Stream(Box<dyn DataSource>),
    SeeOther(String),
    Error(HttpError),
}

struct SinkShared {
    conn: Arc<ConnShared>,
    uri: String,
    reply: Mutex<Option<oneshot::Sender<Outcome>>>,
}

/// Server-side response sink bound to one request.
#[derive(Clone)]
pub struct HttpSink {
    shared: Arc<SinkShared>,
}

impl HttpSink {
    pub(crate) fn new(conn: Arc<ConnShared>, uri: String) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let sink = Self {
            shared: Arc::new(SinkShared {
                conn,
                uri,
                reply: Mutex::new(Some(tx)),
            }),
        };
        (sink, rx)
    }

    /// Sends a 2xx response with an in-memory body.
    pub fn content(&self, data: impl Into<Bytes>, info: FileInfo) {
        self.finish(Outcome::Content {
            data: data.into(),
            info,
        });
    }

    /// Streams a 2xx response from a [`DataSource`].
    pub fn content_source(&self, source: Box<dyn DataSource>) {
        self.finish(Outcome::Stream(source));
    }

    /// Sends a 302 redirect to `url`.
    pub fn see_other(&self, url: impl Into<String>) {
        self.finish(Outcome::SeeOther(url.into()));
    }

    /// Renders `entries` as an HTML index of the request target and sends it.
    pub fn listing(&self, entries: &[ListingItem]) {
        let body = render_listing(&self.shared.uri, entries);
        self.content(
            body.into_bytes(),
            FileInfo::new("text/html; charset=utf-8", -1),
        );
    }

    /// Maps `err` to its status response (404/405/503, anything else 500).
    pub fn error(&self, err: HttpError) {
        self.finish(Outcome::Error(err));
    }

    /// Fails with [`HttpError::RequestAborted`] once the connection is done
    /// for; long-running generators poll this cooperatively.
    pub fn check_aborted(&self) -> Result<(), HttpError> {
        if self.shared.conn.finished() {
            Err(HttpError::RequestAborted)
        } else {
            Ok(())
        }
    }

    /// Installs a hook invoked once if the peer closes the connection while
    /// the response is still being generated.
    pub fn set_aborter(&self, cb: impl FnOnce() + Send + 'static) {
        self.shared.conn.set_aborter(Box::new(cb) as AbortCallback);
    }

    fn finish(&self, outcome: Outcome) {
        if !self.shared.conn.valid() {
            return;
        }
        let tx = self.shared.reply.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(outcome);
        }
    }
}
