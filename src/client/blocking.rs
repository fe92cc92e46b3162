use std::{net::SocketAddr, time::Duration};

use tokio::runtime::{self, Runtime};

use super::Client;
use crate::{
    net::{error::Error, wire::Kv, LocalTransport},
    status::Status,
};

/// Synchronous wrapper around `Client`, driven by its own current-thread
/// runtime. Not meant to be used from inside another runtime.
pub struct BlockingClient {
    rt: Runtime,
    inner: Client,
}

impl BlockingClient {
    pub fn connect(addr: SocketAddr) -> Result<Self, Error> {
        let rt = runtime()?;
        let inner = rt.block_on(Client::connect(addr))?;
        Ok(Self { rt, inner })
    }

    pub fn local(transport: &LocalTransport) -> Result<Self, Error> {
        Ok(Self {
            rt: runtime()?,
            inner: Client::local(transport),
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Status> {
        self.rt.block_on(self.inner.get(key))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Status> {
        self.rt.block_on(self.inner.put(key, value))
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), Status> {
        self.rt.block_on(self.inner.delete(key))
    }

    pub fn scan(
        &self,
        start: Option<&[u8]>,
        limit: Option<u64>,
    ) -> Result<Vec<Kv>, Status> {
        self.rt.block_on(self.inner.scan(start, limit))
    }

    pub fn warmup(
        &self,
        data_size: usize,
        resp_size: usize,
    ) -> Result<Duration, Status> {
        self.rt.block_on(self.inner.warmup(data_size, resp_size))
    }

    pub fn close(self) {
        let Self { rt, inner } = self;
        rt.block_on(inner.close());
    }
}

fn runtime() -> Result<Runtime, Error> {
    Ok(runtime::Builder::new_current_thread().enable_all().build()?)
}
