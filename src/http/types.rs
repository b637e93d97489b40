use crate::http::date::format_http_date;

/// Cache lifetime is unknown; consumers fall back to their own policy.
pub const CACHE_UNSPECIFIED: i64 = -1;

/// The origin demands revalidation on every use.
pub const MUST_REVALIDATE: i64 = -2;

/// A single HTTP header. Order matters and duplicates are permitted, so
/// header collections are plain vectors rather than maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Finds the first header with the given name, case-insensitively.
pub fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Parse state of an incoming request.
///
/// - `Reading`: request line or headers still arriving
/// - `Ready`: terminating blank line seen, request is dispatchable
/// - `Broken`: a line failed to parse; the 400 path runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Reading,
    Ready,
    Broken,
}

/// An incoming request as read off the wire.
///
/// The method is kept as the raw token so that unknown methods still parse
/// and reach dispatch, where they draw a 405 rather than a parse failure.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// Raw request target, exactly as received.
    pub uri: String,
    pub version: String,
    pub headers: Vec<Header>,
    /// Lines parsed so far: the request line plus every header line
    /// (folded continuations included, the terminating blank line not).
    /// Kept for diagnostics.
    pub lines: usize,
    pub state: RequestState,
}

impl Request {
    pub fn new() -> Self {
        Self {
            method: String::new(),
            uri: String::new(),
            version: "HTTP/1.1".to_string(),
            headers: Vec::new(),
            lines: 0,
            state: RequestState::Reading,
        }
    }

    pub fn make_ready(&mut self) {
        self.state = RequestState::Ready;
    }

    pub fn make_broken(&mut self) {
        self.state = RequestState::Broken;
    }

    /// First value of the named header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_head(&self) -> bool {
        self.method == "HEAD"
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP status codes emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK
    Ok,
    /// 302 Found
    Found,
    /// 304 Not Modified
    NotModified,
    /// 400 Bad Request
    BadRequest,
    /// 401 Not Authorized
    NotAuthorized,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
    /// 405 Not Allowed
    NotAllowed,
    /// 500 Internal Server Error
    InternalServerError,
    /// 503 Service Unavailable
    ServiceUnavailable,
}

impl StatusCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::Found => 302,
            StatusCode::NotModified => 304,
            StatusCode::BadRequest => 400,
            StatusCode::NotAuthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::NotAllowed => 405,
            StatusCode::InternalServerError => 500,
            StatusCode::ServiceUnavailable => 503,
        }
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Found => "Found",
            StatusCode::NotModified => "Not Modified",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotAuthorized => "Not Authorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::NotAllowed => "Not Allowed",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// An outgoing response. User headers ride along verbatim; `Date`, `Server`
/// and `Content-Length` are appended by the connection when emitting.
#[derive(Debug, Clone)]
pub struct Response {
    pub code: StatusCode,
    pub headers: Vec<Header>,
    /// Free-form reason recorded in the post-dispatch log for non-200s.
    pub reason: String,
    /// Forces `Connection: close` and connection termination after send.
    pub close: bool,
}

impl Response {
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            headers: Vec::new(),
            reason: String::new(),
            close: false,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

/// Metadata describing a response body.
///
/// `last_modified < 0` means unknown. `expires` carries either a max-age in
/// seconds, an absolute epoch from an `Expires` header, or one of the
/// [`CACHE_UNSPECIFIED`] / [`MUST_REVALIDATE`] sentinels.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub content_type: String,
    pub last_modified: i64,
    pub expires: i64,
}

impl FileInfo {
    pub fn new(content_type: impl Into<String>, last_modified: i64) -> Self {
        Self {
            content_type: content_type.into(),
            last_modified,
            expires: CACHE_UNSPECIFIED,
        }
    }
}

impl Default for FileInfo {
    fn default() -> Self {
        Self {
            content_type: "application/octet-stream".to_string(),
            last_modified: -1,
            expires: CACHE_UNSPECIFIED,
        }
    }
}

impl FileInfo {
    /// Renders the `Last-Modified` value; an unknown time formats as "now".
    pub(crate) fn last_modified_header(&self) -> String {
        format_http_date(self.last_modified)
    }
}
