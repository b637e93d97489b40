//! Batched resource fetching.
//!
//! A [`MultiQuery`] is an ordered batch of [`Query`] items that completes as
//! a unit: every sub-query settles (body, error or redirect), and the
//! caller's completion callback runs exactly once with the populated batch.
//! With a runtime attached, the callback is posted there instead of running
//! inline on whichever worker finished last.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::runtime::Handle;

use crate::client::{ClientSink, ContentFetcher, FetchOptions};
use crate::error::HttpError;
use crate::http::types::FileInfo;

/// A fetched body with its cache-relevant metadata.
#[derive(Debug, Clone)]
pub struct QueryBody {
    pub data: Bytes,
    pub content_type: String,
    pub last_modified: i64,
    pub expires: i64,
}

/// Result slot of one sub-query.
#[derive(Debug, Clone)]
pub enum QueryResult {
    /// Not settled yet; never seen by the completion callback.
    Pending,
    Body(QueryBody),
    Error(HttpError),
    Redirect(String),
}

/// One URL of a batch, with its per-request knobs and its result slot.
#[derive(Debug, Clone)]
pub struct Query {
    location: String,
    timeout_ms: i64,
    reuse: bool,
    result: QueryResult,
}

impl Query {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            timeout_ms: -1,
            reuse: true,
            result: QueryResult::Pending,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn timeout(&self) -> i64 {
        self.timeout_ms
    }

    pub fn reuse(&self) -> bool {
        self.reuse
    }

    pub fn result(&self) -> &QueryResult {
        &self.result
    }

    /// True when the query settled with a body.
    pub fn valid(&self) -> bool {
        matches!(self.result, QueryResult::Body(_))
    }

    pub fn get(&self) -> Option<&QueryBody> {
        match &self.result {
            QueryResult::Body(body) => Some(body),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&HttpError> {
        match &self.result {
            QueryResult::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn redirect(&self) -> Option<&str> {
        match &self.result {
            QueryResult::Redirect(url) => Some(url),
            _ => None,
        }
    }

    pub(crate) fn set(
        &mut self,
        last_modified: i64,
        expires: i64,
        data: Bytes,
        content_type: String,
    ) {
        self.result = QueryResult::Body(QueryBody {
            data,
            content_type,
            last_modified,
            expires,
        });
    }

    pub(crate) fn set_error(&mut self, err: HttpError) {
        self.result = QueryResult::Error(err);
    }

    pub(crate) fn set_redirect(&mut self, url: String) {
        self.result = QueryResult::Redirect(url);
    }
}

/// An ordered batch of queries completing as a unit.
#[derive(Debug, Clone, Default)]
pub struct MultiQuery {
    pub(crate) queries: Vec<Query>,
}

impl MultiQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, query: Query) {
        self.queries.push(query);
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Query> {
        self.queries.iter()
    }
}

impl From<Vec<Query>> for MultiQuery {
    fn from(queries: Vec<Query>) -> Self {
        Self { queries }
    }
}

impl From<Query> for MultiQuery {
    fn from(query: Query) -> Self {
        Self {
            queries: vec![query],
        }
    }
}

impl IntoIterator for MultiQuery {
    type Item = Query;
    type IntoIter = std::vec::IntoIter<Query>;

    fn into_iter(self) -> Self::IntoIter {
        self.queries.into_iter()
    }
}

type Done = Box<dyn FnOnce(MultiQuery) + Send>;

/// Fetches batches of HTTP resources through a [`ContentFetcher`].
pub struct ResourceFetcher {
    fetcher: Arc<dyn ContentFetcher>,
    runtime: Option<Handle>,
}

impl ResourceFetcher {
    pub fn new(fetcher: Arc<dyn ContentFetcher>) -> Self {
        Self {
            fetcher,
            runtime: None,
        }
    }

    /// Posts completion callbacks onto `handle` instead of invoking them on
    /// the worker that finished last.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Fans the batch out, one transfer per query, and calls `done` exactly
    /// once when every sub-query has settled.
    pub fn perform(&self, queries: MultiQuery, done: impl FnOnce(MultiQuery) + Send + 'static) {
        let count = queries.len();
        if count == 0 {
            complete(self.runtime.as_ref(), Box::new(done), queries);
            return;
        }

        // snapshot the request knobs before the batch moves into shared state
        let requests: Vec<(String, FetchOptions)> = queries
            .iter()
            .map(|q| {
                (
                    q.location().to_string(),
                    FetchOptions {
                        reuse: q.reuse(),
                        timeout_ms: q.timeout(),
                        ..FetchOptions::default()
                    },
                )
            })
            .collect();

        let fan = Arc::new(FanOut {
            slots: Mutex::new(queries.queries),
            left: AtomicUsize::new(count),
            done: Mutex::new(Some(Box::new(done))),
            runtime: self.runtime.clone(),
        });

        for (index, (location, options)) in requests.into_iter().enumerate() {
            let sink = Box::new(SubSink {
                owner: fan.clone(),
                index,
            });
            if let Err(err) = self.fetcher.fetch(&location, sink, options) {
                fan.slots.lock().unwrap()[index].set_error(err);
                fan.ping();
            }
        }
    }
}

/// Rendezvous for a batch: result slots plus the countdown that gates the
/// single completion-callback invocation.
struct FanOut {
    slots: Mutex<Vec<Query>>,
    left: AtomicUsize,
    done: Mutex<Option<Done>>,
    runtime: Option<Handle>,
}

impl FanOut {
    /// Records one settled sub-query; the decrement that reaches zero owns
    /// the completion callback.
    fn ping(&self) {
        if self.left.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        tracing::debug!("all subqueries finished");

        let done = self.done.lock().unwrap().take();
        let queries = std::mem::take(&mut *self.slots.lock().unwrap());
        if let Some(done) = done {
            complete(self.runtime.as_ref(), done, MultiQuery::from(queries));
        }
    }
}

fn complete(runtime: Option<&Handle>, done: Done, queries: MultiQuery) {
    match runtime {
        Some(handle) => {
            handle.spawn(async move { invoke(done, queries) });
        }
        None => invoke(done, queries),
    }
}

fn invoke(done: Done, queries: MultiQuery) {
    if catch_unwind(AssertUnwindSafe(|| done(queries))).is_err() {
        tracing::error!("resource fetch callback failed");
    }
}

struct SubSink {
    owner: Arc<FanOut>,
    index: usize,
}

impl ClientSink for SubSink {
    fn content(self: Box<Self>, data: Bytes, info: FileInfo) {
        self.owner.slots.lock().unwrap()[self.index].set(
            info.last_modified,
            info.expires,
            data,
            info.content_type,
        );
        self.owner.ping();
    }

    fn not_modified(self: Box<Self>) {
        self.owner.slots.lock().unwrap()[self.index]
            .set_error(HttpError::NotModified("Not Modified".to_string()));
        self.owner.ping();
    }

    fn see_other(self: Box<Self>, url: String) {
        self.owner.slots.lock().unwrap()[self.index].set_redirect(url);
        self.owner.ping();
    }

    fn error(self: Box<Self>, err: HttpError) {
        self.owner.slots.lock().unwrap()[self.index].set_error(err);
        self.owner.ping();
    }
}
