//! Server half of the engine.
//!
//! The pieces fit together like this: an [`acceptor`](self::acceptor) hands
//! accepted sockets to per-connection actors
//! ([`connection`](self::connection)), which parse pipelined requests and
//! call the host's [`ContentGenerator`] with an [`HttpSink`] bound to each
//! request. The generator answers through the sink — immediately, or later
//! from any thread it likes — and the connection streams the response back
//! in arrival order.
//!
//! ```text
//!   accept ─▶ parse request line ─▶ parse headers ─▶ dispatch ─▶ respond ─┐
//!     ▲                                                                   │
//!     └────────────────────────── keep-alive loop ◀──────────────────────┘
//! ```

pub(crate) mod acceptor;
pub(crate) mod connection;
pub mod sink;

pub use sink::{DataSource, HttpSink, ListingItem, ListingKind};

use crate::error::HttpError;
use crate::http::types::Request;

/// Server-side request handler plugged in by the host.
///
/// `generate` runs on a server worker thread with the parsed request and a
/// sink for the response. Returning an error (or panicking) makes the engine
/// emit the matching error response. Long-running handlers should poll
/// [`HttpSink::check_aborted`] and may park the sink for later completion.
pub trait ContentGenerator: Send + Sync {
    fn generate(&self, request: &Request, sink: HttpSink) -> Result<(), HttpError>;
}

impl<F> ContentGenerator for F
where
    F: Fn(&Request, HttpSink) -> Result<(), HttpError> + Send + Sync,
{
    fn generate(&self, request: &Request, sink: HttpSink) -> Result<(), HttpError> {
        self(request, sink)
    }
}
