use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use tokio::{sync::watch, time};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerConfig,
    net::{QueueHandle, Transport},
    store::Store,
};

mod call;
mod queue;

use self::queue::{CompletionQueue, LiveGuard};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("at least one dispatch queue is required")]
    NoQueues,
    #[error("failed to start a dispatch worker: {0}")]
    Spawn(#[from] io::Error),
    #[error("{0} dispatch worker(s) panicked")]
    WorkerPanicked(usize),
}

struct Shared {
    queues: Vec<QueueHandle>,
    transport: Arc<dyn Transport>,
    store: Store,
    grace: Duration,
    stopping: AtomicBool,
    transport_closed: AtomicBool,
    store_closed: AtomicBool,
    /// Number of queues not yet dropped.
    live: Arc<watch::Sender<usize>>,
}

/// The listener pool: N dispatch queues, each drained by its own worker
/// thread, all serving one store through one transport.
pub struct Server {
    queues: Vec<CompletionQueue>,
    handle: ServerHandle,
}

impl Server {
    pub fn new(
        config: &ServerConfig,
        store: Store,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, Error> {
        if config.queues == 0 {
            Err(Error::NoQueues)?
        }
        let live = Arc::new(watch::channel(config.queues).0);
        let queues: Vec<_> = (0..config.queues)
            .map(|id| {
                CompletionQueue::new(
                    id,
                    store.clone(),
                    transport.clone(),
                    LiveGuard::new(live.clone()),
                )
            })
            .collect();
        let shared = Shared {
            queues: queues.iter().map(CompletionQueue::handle).collect(),
            transport,
            store,
            grace: config.shutdown_grace,
            stopping: AtomicBool::new(false),
            transport_closed: AtomicBool::new(false),
            store_closed: AtomicBool::new(false),
            live,
        };
        Ok(Self {
            queues,
            handle: ServerHandle {
                shared: Arc::new(shared),
            },
        })
    }

    /// A handle for stopping the server from elsewhere, typically a signal
    /// task.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Seeds every queue with one listener per method, starts one worker per
    /// queue and blocks until all of them have exited.
    pub fn run(self) -> Result<(), Error> {
        self.run_with(|name, queue| {
            thread::Builder::new().name(name).spawn(move || queue.run())
        })
    }

    fn run_with<F>(self, mut spawn: F) -> Result<(), Error>
    where
        F: FnMut(String, CompletionQueue) -> io::Result<thread::JoinHandle<()>>,
    {
        let Server { mut queues, handle } = self;
        for queue in &mut queues {
            queue.seed();
        }
        info!(queues = queues.len(), "starting dispatch workers");

        let mut workers = Vec::with_capacity(queues.len());
        let mut pending = queues.into_iter();
        while let Some(queue) = pending.next() {
            match spawn(format!("kv-queue-{}", queue.id()), queue) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    error!("could not start a dispatch worker: {e}");
                    handle.abort();
                    drop(pending);
                    for worker in workers {
                        let _ = worker.join();
                    }
                    handle.finish();
                    return Err(e.into());
                }
            }
        }

        let panicked = workers
            .into_iter()
            .map(thread::JoinHandle::join)
            .filter(Result::is_err)
            .count();
        if panicked > 0 {
            error!(panicked, "dispatch workers panicked");
            Err(Error::WorkerPanicked(panicked))?
        }
        info!("all dispatch workers exited");
        Ok(())
    }
}

/// Cloneable control handle for a `Server`.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Stops the server: refuses new requests, lets every queue drain its
    /// live Calls, then closes the transport and the store.
    ///
    /// Calls still blocked on a write once the grace period is over are
    /// abandoned. Stopping twice is harmless; every caller returns once the
    /// server is down.
    pub async fn stop(&self) {
        if !self.begin_stop() {
            debug!("stop already requested");
        }
        let mut live = self.shared.live.subscribe();
        // the sender lives in `shared`, so these only end at zero
        let drained =
            time::timeout(self.shared.grace, live.wait_for(|n| *n == 0))
                .await
                .is_ok();
        if !drained {
            warn!(
                live = self.live_queues(),
                grace = ?self.shared.grace,
                "queues still busy after the grace period"
            );
            // fails the writes the stuck Calls are waiting on
            self.close_transport();
            self.abort_queues();
            let _ = live.wait_for(|n| *n == 0).await;
        }
        self.finish();
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Number of dispatch queues that have not exited yet.
    pub fn live_queues(&self) -> usize {
        *self.shared.live.borrow()
    }

    fn begin_stop(&self) -> bool {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!("stopping server");
        self.shared.transport.shutdown();
        for queue in &self.shared.queues {
            if !queue.shutdown() {
                debug!(queue = queue.id(), "queue already exited");
            }
        }
        true
    }

    /// Stops without a grace period. Live Calls are dropped as soon as their
    /// queue gets to it.
    fn abort(&self) {
        self.begin_stop();
        self.abort_queues();
    }

    fn abort_queues(&self) {
        for queue in &self.shared.queues {
            queue.abort();
        }
    }

    fn close_transport(&self) {
        if !self.shared.transport_closed.swap(true, Ordering::AcqRel) {
            self.shared.transport.close();
        }
    }

    /// Closes the transport and the store. Only valid once every queue exited.
    fn finish(&self) {
        self.close_transport();
        if self.shared.store_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let status = self.shared.store.close();
        if !status.is_ok() {
            warn!(%status, "store did not close cleanly");
        }
        info!("server stopped");
    }
}
