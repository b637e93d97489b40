//! Listening socket management.
//!
//! An acceptor binds synchronously, so the actual local endpoint (relevant
//! when the caller asked for port 0) is known before the server threads run.
//! Arming moves the socket onto the server runtime, where an accept loop
//! creates a connection actor per peer and immediately re-arms itself.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::engine::EngineCore;
use crate::error::HttpError;
use crate::server::connection::{self, ConnShared};
use crate::server::ContentGenerator;

pub(crate) struct Acceptor {
    local_addr: SocketAddr,
    listener: Mutex<Option<std::net::TcpListener>>,
    generator: Arc<dyn ContentGenerator>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    /// Binds to `addr` right away; accepting starts when armed.
    pub(crate) fn bind(
        addr: SocketAddr,
        generator: Arc<dyn ContentGenerator>,
    ) -> Result<Arc<Self>, HttpError> {
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| HttpError::Transport(format!("cannot listen at {}: {}", addr, e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| HttpError::Transport(format!("cannot listen at {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| HttpError::Transport(format!("cannot listen at {}: {}", addr, e)))?;

        Ok(Arc::new(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            generator,
            task: Mutex::new(None),
        }))
    }

    /// The endpoint actually bound.
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts the accept loop on the server runtime. Arming twice is a no-op.
    pub(crate) fn arm(&self, handle: &Handle, engine: Arc<EngineCore>) {
        let Some(std_listener) = self.listener.lock().unwrap().take() else {
            return;
        };
        let generator = self.generator.clone();
        let local_addr = self.local_addr;

        let task = handle.spawn(async move {
            let listener = match TcpListener::from_std(std_listener) {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::error!(addr = %local_addr, error = %err, "cannot register listener");
                    return;
                }
            };
            tracing::debug!(addr = %local_addr, "listening");

            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let shared = ConnShared::new();
                        tracing::debug!(conn = shared.id, peer = %peer, "accepted connection");
                        engine.add_connection(shared.clone());
                        tokio::spawn(connection::run(
                            stream,
                            shared,
                            engine.clone(),
                            generator.clone(),
                        ));
                    }
                    Err(err) => {
                        tracing::warn!(addr = %local_addr, error = %err, "error accepting");
                    }
                }
            }
        });

        *self.task.lock().unwrap() = Some(task);
    }

    /// Stops accepting. Live connections are untouched.
    pub(crate) fn abort(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}
