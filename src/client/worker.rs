//! Client transfer worker.
//!
//! Each worker owns a dedicated OS thread driving its own current-thread
//! reactor, so client teardown never touches the server runtime. Fetch tasks
//! arrive over a channel — posting is the only thread-safe entry into a
//! worker — and every transfer runs as a local task against worker-local
//! state (the descriptor table is only ever touched from this thread).
//!
//! On stop the task channel is closed; the worker finishes in-flight
//! transfers, then tears down its reactor, which drops anything still
//! pending together with its sockets.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::client::dns::DnsCache;
use crate::client::transfer::{self, FetchTask, SocketTable, WorkerCtx};
use crate::client::ClientOptions;
use crate::error::HttpError;

pub(crate) struct TransferWorker {
    id: usize,
    tx: Option<mpsc::UnboundedSender<FetchTask>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TransferWorker {
    pub(crate) fn spawn(
        id: usize,
        dns: Arc<DnsCache>,
        options: &ClientOptions,
    ) -> Result<Self, HttpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let max_connections = options.max_total_connections;

        let thread = std::thread::Builder::new()
            .name(format!("chttp:{}", id))
            .spawn(move || run(id, rx, dns, max_connections))
            .map_err(|e| {
                HttpError::InternalError(format!("cannot spawn client worker: {}", e))
            })?;

        Ok(Self {
            id,
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Posts a fetch onto the worker's reactor.
    pub(crate) fn post(&self, task: FetchTask) -> Result<(), HttpError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(HttpError::Transport("client worker is stopped".to_string()));
        };
        tx.send(task)
            .map_err(|_| HttpError::Transport("client worker is gone".to_string()))
    }

    /// Closes the task queue and joins the worker thread.
    pub(crate) fn stop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TransferWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    id: usize,
    mut rx: mpsc::UnboundedReceiver<FetchTask>,
    dns: Arc<DnsCache>,
    max_connections: usize,
) {
    tracing::debug!(worker = id, "spawned HTTP client worker");

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(worker = id, error = %err, "cannot build client reactor");
            while let Ok(task) = rx.try_recv() {
                task.sink
                    .error(HttpError::Transport("client reactor unavailable".to_string()));
            }
            return;
        }
    };

    let ctx = Rc::new(WorkerCtx {
        id,
        dns,
        sockets: RefCell::new(SocketTable::new()),
    });
    let limit = (max_connections > 0).then(|| Arc::new(Semaphore::new(max_connections)));

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async {
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        while let Some(task) = rx.recv().await {
            in_flight.retain(|handle| !handle.is_finished());

            let ctx = ctx.clone();
            let limit = limit.clone();
            in_flight.push(tokio::task::spawn_local(async move {
                let _permit = match limit {
                    Some(limit) => limit.acquire_owned().await.ok(),
                    None => None,
                };
                transfer::run(task, ctx).await;
            }));
        }

        // queue closed: let in-flight transfers settle their sinks
        for handle in in_flight {
            let _ = handle.await;
        }
    });

    let sockets = ctx.sockets.borrow();
    tracing::debug!(
        worker = id,
        opened = sockets.opened(),
        closed = sockets.closed(),
        live = sockets.live(),
        "terminated HTTP client worker"
    );
}
