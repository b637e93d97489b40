//! Client half of the engine.
//!
//! A fixed set of [`worker`](self::worker) threads multiplexes all outbound
//! transfers; the [`ClientPool`] hands each fetch to the next worker in
//! round-robin order. Results come back through a one-shot [`ClientSink`].
//! The [`OnDemandClient`] variant stays dormant until the first fetch.

pub(crate) mod dns;
pub(crate) mod transfer;
pub(crate) mod worker;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::client::dns::DnsCache;
use crate::client::transfer::FetchTask;
use crate::client::worker::TransferWorker;
use crate::error::HttpError;
use crate::fetcher::ResourceFetcher;
use crate::http::types::FileInfo;

/// Consumer of one outbound transfer's result. Each sink is settled by
/// exactly one of these calls.
pub trait ClientSink: Send {
    /// 2xx with a body.
    fn content(self: Box<Self>, data: Bytes, info: FileInfo);

    /// 304 to a conditional request.
    fn not_modified(self: Box<Self>);

    /// Unfollowed redirect; `url` is the target location.
    fn see_other(self: Box<Self>, url: String);

    /// Transport failure or status-bearing error.
    fn error(self: Box<Self>, err: HttpError);
}

/// Per-fetch options.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub follow_redirects: bool,
    /// Empty means the engine default.
    pub user_agent: String,
    /// Sends `If-Modified-Since` when non-negative.
    pub last_modified: i64,
    /// Allows connection reuse; off adds `Connection: close`.
    pub reuse: bool,
    /// Non-positive means the engine default.
    pub timeout_ms: i64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            follow_redirects: true,
            user_agent: String::new(),
            last_modified: -1,
            reuse: true,
            timeout_ms: -1,
        }
    }
}

/// Options applied to the whole client at startup.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Caps concurrently running transfers per worker; 0 means unlimited.
    pub max_total_connections: usize,
    /// Transfer-engine pipelining hint.
    pub pipelining: usize,
}

/// Entry point for outbound fetches; implemented by the engine's client pool
/// and by [`OnDemandClient`].
///
/// On `Err` the sink has not been touched: the fetch never started.
pub trait ContentFetcher: Send + Sync {
    fn fetch(
        &self,
        location: &str,
        sink: Box<dyn ClientSink>,
        options: FetchOptions,
    ) -> Result<(), HttpError>;
}

/// Round-robin index dispenser. Advancing over an empty set is a hard error,
/// raised before any I/O happens.
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
        }
    }

    /// Picks the next slot out of `len`, wrapping at the end.
    pub fn pick(&self, len: usize) -> Result<usize, HttpError> {
        if len == 0 {
            return Err(HttpError::Transport(
                "cannot perform fetch request: no client is running".to_string(),
            ));
        }
        Ok(self.next.fetch_add(1, Ordering::Relaxed) % len)
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

/// The running client: workers plus the round-robin dispatcher.
pub(crate) struct ClientPool {
    workers: Vec<TransferWorker>,
    rr: RoundRobin,
}

impl ClientPool {
    pub(crate) fn start(
        threads: usize,
        options: &ClientOptions,
        dns: Arc<DnsCache>,
    ) -> Result<Self, HttpError> {
        tracing::debug!(
            threads,
            max_total_connections = options.max_total_connections,
            pipelining = options.pipelining,
            "starting HTTP client"
        );
        let mut workers = Vec::with_capacity(threads);
        for id in 1..=threads {
            workers.push(TransferWorker::spawn(id, dns.clone(), options)?);
        }
        Ok(Self {
            workers,
            rr: RoundRobin::new(),
        })
    }

    pub(crate) fn fetch(
        &self,
        location: &str,
        sink: Box<dyn ClientSink>,
        options: FetchOptions,
    ) -> Result<(), HttpError> {
        let index = self.rr.pick(self.workers.len())?;
        let worker = &self.workers[index];
        tracing::debug!(worker = worker.id(), "about to fetch <{}>", location);
        worker.post(FetchTask {
            location: location.to_string(),
            sink,
            options,
        })
    }

    pub(crate) fn stop(&mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
        self.workers.clear();
    }
}

struct OnDemandInner {
    threads: usize,
    options: ClientOptions,
    dns: Arc<DnsCache>,
    pool: Mutex<Option<ClientPool>>,
}

/// Dormant HTTP client: worker threads come up under a mutex on the first
/// fetch and behave like the engine's client from then on.
pub struct OnDemandClient {
    inner: Arc<OnDemandInner>,
}

impl OnDemandClient {
    pub fn new(threads: usize) -> Self {
        Self::with_options(threads, ClientOptions::default())
    }

    pub fn with_options(threads: usize, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(OnDemandInner {
                threads: threads.max(1),
                options,
                dns: DnsCache::new(),
                pool: Mutex::new(None),
            }),
        }
    }

    /// The high-level multi-query API over this client.
    pub fn fetcher(&self) -> ResourceFetcher {
        ResourceFetcher::new(self.inner.clone())
    }
}

impl ContentFetcher for OnDemandInner {
    fn fetch(
        &self,
        location: &str,
        sink: Box<dyn ClientSink>,
        options: FetchOptions,
    ) -> Result<(), HttpError> {
        let mut pool = self.pool.lock().unwrap();
        let pool = match &mut *pool {
            Some(pool) => pool,
            empty => empty.insert(ClientPool::start(
                self.threads,
                &self.options,
                self.dns.clone(),
            )?),
        };
        pool.fetch(location, sink, options)
    }
}
