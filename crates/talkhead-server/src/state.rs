//! Shared session state

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use talkhead_core::RenderService;

/// State shared by every connection handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RenderService>,
    /// Longest request line accepted
    pub max_line_bytes: usize,
    /// How long shutdown waits for in-flight jobs; `None` waits forever
    pub drain_timeout: Option<Duration>,
    active_connections: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(service: Arc<RenderService>, max_line_bytes: usize) -> Self {
        Self {
            service,
            max_line_bytes,
            drain_timeout: None,
            active_connections: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Count a connection until the returned guard is dropped.
    pub fn connection_opened(&self) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            counter: self.active_connections.clone(),
        }
    }

    /// Cancelled once shutdown has finished draining.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Stop new jobs, wait for in-flight ones, then stop accepting
    /// connections. Returns false if the drain timed out.
    pub async fn shutdown(&self) -> bool {
        info!("Shutdown requested");
        self.service.begin_shutdown();
        let drained = self.service.drain(self.drain_timeout).await;
        if !drained {
            warn!("Shutdown drain timed out; remaining jobs are abandoned");
        }
        self.shutdown.cancel();
        drained
    }
}

pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
