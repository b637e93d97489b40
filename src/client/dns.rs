//! Name resolution with a small TTL cache.
//!
//! Entries are keyed `host:port` and live for five minutes. Resolution
//! failures are handed back to the caller and never cached. The cache lock
//! is only held for map access; lookups run on the reactor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::error::HttpError;
use crate::http::date::now_epoch;

const DNS_TTL: i64 = 300;

struct Entry {
    endpoints: Vec<SocketAddr>,
    expires: i64,
}

pub(crate) struct DnsCache {
    cache: Mutex<HashMap<String, Entry>>,
}

impl DnsCache {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Resolves `host:port`, preferring a live cache entry.
    pub(crate) async fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Vec<SocketAddr>, HttpError> {
        let key = format!("{}:{}", host, port);

        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&key) {
                if entry.expires >= now_epoch() {
                    return Ok(entry.endpoints.clone());
                }
            }
        }

        let endpoints: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| HttpError::Transport(format!("DNS resolution of <{}> failed: {}", host, e)))?
            .collect();
        if endpoints.is_empty() {
            return Err(HttpError::Transport(format!(
                "DNS resolution of <{}> returned no endpoints",
                host
            )));
        }
        tracing::debug!(host, port, count = endpoints.len(), "resolved");

        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            key,
            Entry {
                endpoints: endpoints.clone(),
                expires: now_epoch() + DNS_TTL,
            },
        );
        Ok(endpoints)
    }
}
