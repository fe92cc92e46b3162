#![allow(dead_code)]

use std::{sync::Arc, thread};

use kvrpc::{
    config::{EngineKind, ServerConfig},
    net::{LocalTransport, Transport},
    server::{self, Server, ServerHandle},
    store::{Engine, Store},
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A server whose workers run on their own thread.
pub struct Running {
    pub handle: ServerHandle,
    worker: thread::JoinHandle<Result<(), server::Error>>,
}

impl Running {
    pub fn start(
        queues: usize,
        engine: impl Engine,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let config = ServerConfig::builder()
            .queues(queues)
            .engine(EngineKind::Memory)
            .build();
        Self::with_config(&config, engine, transport)
    }

    pub fn with_config(
        config: &ServerConfig,
        engine: impl Engine,
        transport: Arc<dyn Transport>,
    ) -> Self {
        init_tracing();
        let server =
            Server::new(config, Store::new(engine), transport).unwrap();
        let handle = server.handle();
        let worker = thread::Builder::new()
            .name("kv-server".into())
            .spawn(move || server.run())
            .unwrap();
        Self { handle, worker }
    }

    pub fn local(queues: usize, engine: impl Engine) -> (Self, LocalTransport) {
        let transport = LocalTransport::new();
        let running = Self::start(queues, engine, Arc::new(transport.clone()));
        (running, transport)
    }

    pub async fn stop(self) {
        self.handle.stop().await;
        self.join();
    }

    /// Waits for `run` to return. Only valid once the server was stopped.
    pub fn join(self) {
        self.worker.join().unwrap().unwrap();
    }
}
