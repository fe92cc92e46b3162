// kvrpc serves a key-value engine over QUIC. Every inbound RPC is an explicit
// state machine (a Call) owned by exactly one dispatch queue, and each queue
// is drained by a single worker thread. Workers never block on each other:
// the only thing they share is the storage engine, which brings its own
// concurrency control.
//
// The transport is kept behind a small seam (`net::Transport`): it accepts
// registrations for one request of a given method and later reports the
// outcome of every async action as a completion event on the queue that
// registered it. The QUIC endpoint and the in-process transport both sit on
// the same listener bookkeeping.

pub mod config;
pub mod hex;
pub mod limits;
pub mod net;
pub mod status;
pub mod store;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod server;

pub use status::{Code, Status};
