//! janus — a bidirectional HTTP/1.1 engine.
//!
//! One facade, two faces: a multi-threaded pipelined HTTP/1.1 server and a
//! multi-threaded HTTP/1.1 client pool, both driven by asynchronous
//! reactors. The server parses pipelined requests per connection and answers
//! them strictly in order through pluggable [`ContentGenerator`]s; the
//! client multiplexes many concurrent transfers over a few worker threads
//! and batches logical multi-queries through the [`ResourceFetcher`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use janus::{FileInfo, Http, HttpError, HttpSink, Request};
//!
//! let engine = Http::new();
//! let generator = Arc::new(|request: &Request, sink: HttpSink| {
//!     match request.uri.as_str() {
//!         "/hello" => sink.content("hi there", FileInfo::new("text/plain", -1)),
//!         uri => return Err(HttpError::NotFound(format!("no {}", uri))),
//!     }
//!     Ok(())
//! });
//! let addr = engine.listen("127.0.0.1:0".parse().unwrap(), generator)?;
//! engine.start_server(4)?;
//! println!("serving on {}", addr);
//! engine.stop();
//! # Ok::<(), HttpError>(())
//! ```

pub mod client;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod server;

pub use client::{
    ClientOptions, ClientSink, ContentFetcher, FetchOptions, OnDemandClient, RoundRobin,
};
pub use engine::Http;
pub use error::HttpError;
pub use fetcher::{MultiQuery, Query, QueryBody, QueryResult, ResourceFetcher};
pub use http::{FileInfo, Header, Request, RequestState, Response, StatusCode};
pub use server::{ContentGenerator, DataSource, HttpSink, ListingItem, ListingKind};
