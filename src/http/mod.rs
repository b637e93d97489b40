//! Wire-level HTTP/1.1 data model shared by the server and client halves.
//!
//! # Submodules
//!
//! - **`types`**: headers, requests, responses, status codes and file metadata
//! - **`date`**: HTTP-date formatting and parsing (`Wkd, DD Mon YYYY HH:MM:SS GMT`)
//! - **`cache_control`**: the relaxed `Cache-Control` parser used by the client
//!
//! # Request lifecycle
//!
//! Incoming requests move through a small state machine while the connection
//! parses them line by line:
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← request line and header lines still arriving
//!        └──────┬──────┘
//!               │ terminating blank line          │ malformed line
//!               ▼                                 ▼
//!        ┌─────────────┐                   ┌─────────────┐
//!        │    Ready    │                   │   Broken    │
//!        └─────────────┘                   └─────────────┘
//! ```
//!
//! Only `Ready` and `Broken` requests ever reach dispatch; a `Broken` head of
//! the queue produces a 400 response and closes the connection.

pub mod cache_control;
pub mod date;
pub mod types;

pub use types::{
    FileInfo, Header, Request, RequestState, Response, StatusCode, CACHE_UNSPECIFIED,
    MUST_REVALIDATE,
};
