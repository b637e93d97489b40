//! The engine facade.
//!
//! An [`Http`] starts idle. `listen` may be called any number of times, even
//! before the server threads exist; the actual bound endpoint comes back
//! right away. `start_server` brings up the server runtime, `start_client`
//! the client workers, and `stop` drains everything in order: acceptors
//! first, then live connections, then the runtime, then the client workers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::client::dns::DnsCache;
use crate::client::{ClientOptions, ClientPool, ClientSink, ContentFetcher, FetchOptions};
use crate::error::HttpError;
use crate::fetcher::ResourceFetcher;
use crate::server::acceptor::Acceptor;
use crate::server::connection::ConnShared;
use crate::server::ContentGenerator;

/// Bidirectional HTTP/1.1 engine: a pipelined server and a pooled client
/// sharing one process-wide facade.
pub struct Http {
    core: Arc<EngineCore>,
}

#[derive(Default)]
struct ServerState {
    runtime: Option<Runtime>,
    acceptors: Vec<Arc<Acceptor>>,
}

pub(crate) struct EngineCore {
    state: Mutex<ServerState>,
    connections: Mutex<HashMap<usize, Arc<ConnShared>>>,
    drained: Condvar,
    server_header: Mutex<String>,
    client: Mutex<Option<ClientPool>>,
    dns: Arc<DnsCache>,
}

impl EngineCore {
    pub(crate) fn add_connection(&self, conn: Arc<ConnShared>) {
        self.connections.lock().unwrap().insert(conn.id, conn);
    }

    pub(crate) fn remove_connection(&self, id: usize) {
        self.connections.lock().unwrap().remove(&id);
        self.drained.notify_all();
    }

    pub(crate) fn server_header_value(&self) -> String {
        self.server_header.lock().unwrap().clone()
    }
}

impl ContentFetcher for EngineCore {
    fn fetch(
        &self,
        location: &str,
        sink: Box<dyn ClientSink>,
        options: FetchOptions,
    ) -> Result<(), HttpError> {
        let client = self.client.lock().unwrap();
        match client.as_ref() {
            Some(pool) => pool.fetch(location, sink, options),
            None => Err(HttpError::Transport(
                "cannot perform fetch request: no client is running".to_string(),
            )),
        }
    }
}

impl Http {
    /// Creates an idle engine: no threads, no sockets.
    pub fn new() -> Self {
        Self {
            core: Arc::new(EngineCore {
                state: Mutex::new(ServerState::default()),
                connections: Mutex::new(HashMap::new()),
                drained: Condvar::new(),
                server_header: Mutex::new(format!("janus/{}", env!("CARGO_PKG_VERSION"))),
                client: Mutex::new(None),
                dns: DnsCache::new(),
            }),
        }
    }

    /// Listens at `addr` and starts the server machinery right away.
    pub fn serve(
        addr: SocketAddr,
        threads: usize,
        generator: Arc<dyn ContentGenerator>,
    ) -> Result<(Self, SocketAddr), HttpError> {
        let engine = Self::new();
        let local = engine.listen(addr, generator)?;
        engine.start_server(threads)?;
        Ok((engine, local))
    }

    /// Registers an endpoint served by `generator`. The returned address is
    /// the one actually bound, which matters when `addr` asked for port 0.
    pub fn listen(
        &self,
        addr: SocketAddr,
        generator: Arc<dyn ContentGenerator>,
    ) -> Result<SocketAddr, HttpError> {
        let acceptor = Acceptor::bind(addr, generator)?;
        let local = acceptor.local_addr();

        let mut state = self.core.state.lock().unwrap();
        if let Some(runtime) = state.runtime.as_ref() {
            acceptor.arm(runtime.handle(), self.core.clone());
        }
        state.acceptors.push(acceptor);
        Ok(local)
    }

    /// Brings up `threads` server workers and arms every registered
    /// acceptor. Starting an already-running server is an error.
    pub fn start_server(&self, threads: usize) -> Result<(), HttpError> {
        let mut state = self.core.state.lock().unwrap();
        if state.runtime.is_some() {
            return Err(HttpError::InternalError(
                "HTTP machinery is already running".to_string(),
            ));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .enable_all()
            .thread_name_fn(|| {
                static WORKER_ID: AtomicUsize = AtomicUsize::new(0);
                format!("http:{}", WORKER_ID.fetch_add(1, Ordering::Relaxed) + 1)
            })
            .build()
            .map_err(|e| {
                HttpError::InternalError(format!("cannot start HTTP machinery: {}", e))
            })?;

        for acceptor in &state.acceptors {
            acceptor.arm(runtime.handle(), self.core.clone());
        }
        state.runtime = Some(runtime);
        Ok(())
    }

    /// Brings up `threads` client workers. Starting an already-running
    /// client is an error.
    pub fn start_client(&self, threads: usize, options: ClientOptions) -> Result<(), HttpError> {
        let mut client = self.core.client.lock().unwrap();
        if client.is_some() {
            return Err(HttpError::InternalError(
                "HTTP client machinery is already running".to_string(),
            ));
        }
        *client = Some(ClientPool::start(
            threads.max(1),
            &options,
            self.core.dns.clone(),
        )?);
        Ok(())
    }

    /// Full drain: refuse new connections, close live ones, wait for their
    /// callback graph to finish, release the runtime, join client workers.
    /// Stopping an idle or already-stopped engine is a no-op.
    pub fn stop(&self) {
        tracing::debug!("stopping HTTP");

        let (acceptors, runtime) = {
            let mut state = self.core.state.lock().unwrap();
            (std::mem::take(&mut state.acceptors), state.runtime.take())
        };
        for acceptor in &acceptors {
            acceptor.abort();
        }

        {
            let mut connections = self.core.connections.lock().unwrap();
            loop {
                // re-asked every round: an accept already past its last
                // suspension point can still register a connection after the
                // acceptors were aborted
                for conn in connections.values() {
                    conn.request_close();
                }
                if connections.is_empty() {
                    break;
                }
                connections = self
                    .core
                    .drained
                    .wait_timeout(connections, Duration::from_millis(50))
                    .unwrap()
                    .0;
            }
        }

        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }

        if let Some(mut pool) = self.core.client.lock().unwrap().take() {
            pool.stop();
        }
    }

    /// Overrides the `Server:` header value.
    pub fn server_header(&self, value: impl Into<String>) {
        *self.core.server_header.lock().unwrap() = value.into();
    }

    /// The high-level multi-query fetch API backed by this engine's client.
    pub fn fetcher(&self) -> ResourceFetcher {
        ResourceFetcher::new(self.core.clone())
    }

    /// The low-level single-fetch interface, for callers that need
    /// per-request options beyond what [`crate::fetcher::Query`] carries.
    pub fn content_fetcher(&self) -> Arc<dyn ContentFetcher> {
        self.core.clone()
    }

    /// Handle of the server runtime, for hosts that want to piggy-back work
    /// on it. `None` until `start_server`.
    pub fn server_handle(&self) -> Option<Handle> {
        let state = self.core.state.lock().unwrap();
        state.runtime.as_ref().map(|rt| rt.handle().clone())
    }
}

impl Default for Http {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Http {
    fn drop(&mut self) {
        self.stop();
    }
}
