use std::net::{IpAddr, SocketAddr};

pub mod completion;
pub mod endpoint;
pub mod error;
pub mod listeners;
pub mod local;
pub mod wire;

pub use self::{
    completion::{Accepted, Ack, Event, Outgoing, QueueHandle, Responder, Tag},
    endpoint::QuicTransport,
    error::Error,
    listeners::{Inbound, Listeners},
    local::LocalTransport,
    wire::{Kv, Method, Reply, Request},
};

/// ALPN protocol id spoken by both ends of the QUIC transport.
pub const ALPN: &[u8] = b"kvrpc";

/// Server name presented by clients. The server certificate is self-signed
/// for this name.
pub const SERVER_NAME: &str = "kvrpc";

/// What the dispatch queues need from a transport.
pub trait Transport: Send + Sync + 'static {
    /// Registers one pending acceptance for `method`. The next request of
    /// that method is delivered through `ack.accept`; if the transport shuts
    /// down first, the ack is dropped and reports failure.
    fn request_call(&self, method: Method, ack: Ack);

    /// Stops accepting requests and fails every pending acceptance.
    fn shutdown(&self);

    /// Releases transport resources. Called once every queue has drained.
    fn close(&self) {}
}

/// Converts an IP address and port to a socket address.
pub fn ip_addr_to_socket_addr(ip: IpAddr, port: u16) -> SocketAddr {
    match ip {
        IpAddr::V4(ip) => SocketAddr::from((ip, port)),
        IpAddr::V6(ip) => SocketAddr::from((ip, port)),
    }
}
