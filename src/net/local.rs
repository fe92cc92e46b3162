use std::sync::Arc;

use tokio::sync::mpsc;

use super::{
    completion::{Ack, Outgoing},
    listeners::{Inbound, Listeners},
    wire::{Method, Request},
    Transport,
};

/// In-process transport. Requests skip the network and framing entirely but
/// go through the same listener bookkeeping as the QUIC endpoint, so the
/// dispatch path is the one a remote client would see.
#[derive(Clone, Default)]
pub struct LocalTransport {
    listeners: Arc<Listeners>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    /// Starts one RPC and returns the channel its replies arrive on. The
    /// reader completes each reply's ack once it has taken the reply.
    pub fn call(&self, request: Request) -> mpsc::UnboundedReceiver<Outgoing> {
        let (replies, rx) = mpsc::unbounded_channel();
        let inbound = Inbound { request, replies };
        if let Err(inbound) = self.listeners.dispatch(inbound) {
            inbound.refuse();
        }
        rx
    }
}

impl Transport for LocalTransport {
    fn request_call(&self, method: Method, ack: Ack) {
        self.listeners.register(method, ack);
    }

    fn shutdown(&self) {
        self.listeners.shutdown();
    }
}
