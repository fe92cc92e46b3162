use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    completion::{Accepted, Ack, Outgoing, Responder},
    wire::{Method, Reply, Request},
};
use crate::status::Status;

/// Message carried by every refusal or abort caused by shutdown.
pub const SHUTTING_DOWN: &str = "server is shutting down";

/// A request that reached a transport, with the channel its replies go out
/// on.
pub struct Inbound {
    pub request: Request,
    pub replies: mpsc::UnboundedSender<Outgoing>,
}

impl Inbound {
    /// Answers the request without dispatching it, because the server is on
    /// its way down.
    pub fn refuse(self) {
        let reply = Reply::Close(Status::server_error(SHUTTING_DOWN));
        let _ = self.replies.send(Outgoing {
            reply,
            ack: Ack::detached(),
        });
    }
}

#[derive(Default)]
struct State {
    pending: [VecDeque<Ack>; Method::ALL.len()],
    backlog: [VecDeque<Inbound>; Method::ALL.len()],
    shut_down: bool,
}

/// Matches inbound requests with the acceptances registered by the queues.
///
/// Requests that arrive while no acceptance is registered for their method
/// wait in a backlog instead of being refused. Acceptances are used in the
/// order they were registered, which spreads consecutive requests of one
/// method across the queues.
#[derive(Default)]
pub struct Listeners {
    state: Mutex<State>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, method: Method, ack: Ack) {
        let mut state = self.state.lock();
        if state.shut_down {
            drop(state);
            trace!(%method, "refusing registration after shutdown");
            // dropping the ack reports the failed registration
            return;
        }
        match state.backlog[method.index()].pop_front() {
            Some(inbound) => {
                drop(state);
                deliver(ack, inbound);
            }
            None => state.pending[method.index()].push_back(ack),
        }
    }

    /// Hands `inbound` to a registered acceptance, or parks it until one is
    /// registered. Gives the request back if the listeners are shut down.
    pub fn dispatch(&self, inbound: Inbound) -> Result<(), Inbound> {
        let method = inbound.request.method();
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(inbound);
        }
        match state.pending[method.index()].pop_front() {
            Some(ack) => {
                drop(state);
                deliver(ack, inbound);
            }
            None => {
                trace!(%method, "no listener registered, parking request");
                state.backlog[method.index()].push_back(inbound);
            }
        }
        Ok(())
    }

    /// Fails every pending acceptance and drops every parked request. Later
    /// registrations fail immediately and later requests are given back.
    pub fn shutdown(&self) {
        let (pending, backlog) = {
            let mut state = self.state.lock();
            state.shut_down = true;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.backlog),
            )
        };
        let failed: usize = pending.iter().map(VecDeque::len).sum();
        let parked: usize = backlog.iter().map(VecDeque::len).sum();
        debug!(failed, parked, "listeners shut down");
        // acks and reply senders are dropped outside the lock
        drop(pending);
        drop(backlog);
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Number of acceptances currently registered for `method`.
    pub fn pending(&self, method: Method) -> usize {
        self.state.lock().pending[method.index()].len()
    }

    /// Number of requests of `method` waiting for an acceptance.
    pub fn parked(&self, method: Method) -> usize {
        self.state.lock().backlog[method.index()].len()
    }
}

fn deliver(ack: Ack, inbound: Inbound) {
    ack.accept(Accepted {
        request: inbound.request,
        responder: Responder::new(inbound.replies),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::completion::{Message, QueueHandle, Tag};

    fn inbound(key: &[u8]) -> (Inbound, mpsc::UnboundedReceiver<Outgoing>) {
        let (replies, rx) = mpsc::unbounded_channel();
        let request = Request::Get { key: key.to_vec() };
        (Inbound { request, replies }, rx)
    }

    fn accepted_key(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<u8> {
        match rx.try_recv() {
            Ok(Message::Event(event)) => {
                assert!(event.ok);
                match event.accepted.map(|a| a.request) {
                    Some(Request::Get { key }) => key,
                    other => panic!("unexpected request {other:?}"),
                }
            }
            _ => panic!("expected an accepted request"),
        }
    }

    #[test]
    fn request_goes_to_registered_acceptance() {
        let listeners = Listeners::new();
        let (queue, mut rx) = QueueHandle::channel(0);
        listeners.register(Method::Get, queue.ack(Tag::new(0, 0)));
        assert_eq!(listeners.pending(Method::Get), 1);
        assert_eq!(listeners.pending(Method::Put), 0);

        let (req, _replies) = inbound(b"a");
        assert!(listeners.dispatch(req).is_ok());
        assert_eq!(accepted_key(&mut rx), b"a");
        assert_eq!(listeners.pending(Method::Get), 0);
    }

    #[test]
    fn early_requests_wait_for_a_listener() {
        let listeners = Listeners::new();
        let (queue, mut rx) = QueueHandle::channel(0);
        let (first, _r1) = inbound(b"first");
        let (second, _r2) = inbound(b"second");
        assert!(listeners.dispatch(first).is_ok());
        assert!(listeners.dispatch(second).is_ok());
        assert_eq!(listeners.parked(Method::Get), 2);

        listeners.register(Method::Get, queue.ack(Tag::new(0, 0)));
        listeners.register(Method::Get, queue.ack(Tag::new(1, 0)));
        assert_eq!(accepted_key(&mut rx), b"first");
        assert_eq!(accepted_key(&mut rx), b"second");
        assert_eq!(listeners.parked(Method::Get), 0);
    }

    #[test]
    fn acceptances_are_used_in_registration_order() {
        let listeners = Listeners::new();
        let (q0, mut rx0) = QueueHandle::channel(0);
        let (q1, mut rx1) = QueueHandle::channel(1);
        listeners.register(Method::Get, q0.ack(Tag::new(0, 0)));
        listeners.register(Method::Get, q1.ack(Tag::new(0, 0)));

        let (a, _ra) = inbound(b"a");
        let (b, _rb) = inbound(b"b");
        listeners.dispatch(a).ok();
        listeners.dispatch(b).ok();
        assert_eq!(accepted_key(&mut rx0), b"a");
        assert_eq!(accepted_key(&mut rx1), b"b");
    }

    #[test]
    fn shutdown_fails_pending_and_refuses_new_work() {
        let listeners = Listeners::new();
        let (queue, mut rx) = QueueHandle::channel(0);
        listeners.register(Method::Scan, queue.ack(Tag::new(4, 2)));
        listeners.shutdown();
        assert!(listeners.is_shut_down());

        match rx.try_recv() {
            Ok(Message::Event(event)) => {
                assert_eq!(event.tag, Tag::new(4, 2));
                assert!(!event.ok);
            }
            _ => panic!("pending acceptance was not failed"),
        }

        listeners.register(Method::Get, queue.ack(Tag::new(5, 0)));
        assert!(matches!(
            rx.try_recv(),
            Ok(Message::Event(event)) if !event.ok
        ));

        let (req, mut replies) = inbound(b"late");
        let req = listeners.dispatch(req).err().expect("request given back");
        req.refuse();
        let refusal = replies.try_recv().expect("refusal written");
        assert_eq!(
            refusal.reply,
            Reply::Close(Status::server_error(SHUTTING_DOWN))
        );
    }

    #[test]
    fn shutdown_releases_parked_requests() {
        let listeners = Listeners::new();
        let (req, mut replies) = inbound(b"parked");
        listeners.dispatch(req).ok();
        listeners.shutdown();
        // the reply channel closes once the parked request is dropped
        assert!(matches!(
            replies.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
