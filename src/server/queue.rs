use std::sync::Arc;

use slab::Slab;
use tokio::sync::{mpsc, watch};
use tracing::{debug, debug_span, trace, warn};

use super::call::{Call, Context, State, Step};
use crate::{
    net::{
        completion::{Event, Message, QueueHandle, Tag},
        wire::Method,
        Transport,
    },
    store::Store,
};

struct Entry {
    generation: u64,
    call: Call,
}

/// Counts a queue as live until it is dropped, whether it ran to completion,
/// panicked or never ran at all.
pub(crate) struct LiveGuard(Arc<watch::Sender<usize>>);

impl LiveGuard {
    pub(crate) fn new(live: Arc<watch::Sender<usize>>) -> Self {
        Self(live)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// One dispatch queue: a private stream of completion events and the arena
/// of Calls those events belong to. Owned and drained by a single worker.
pub(crate) struct CompletionQueue {
    id: usize,
    rx: mpsc::UnboundedReceiver<Message>,
    handle: QueueHandle,
    calls: Slab<Entry>,
    next_generation: u64,
    draining: bool,
    store: Store,
    transport: Arc<dyn Transport>,
    _live: LiveGuard,
}

impl CompletionQueue {
    pub(crate) fn new(
        id: usize,
        store: Store,
        transport: Arc<dyn Transport>,
        live: LiveGuard,
    ) -> Self {
        let (handle, rx) = QueueHandle::channel(id);
        Self {
            id,
            rx,
            handle,
            calls: Slab::new(),
            next_generation: 0,
            draining: false,
            store,
            transport,
            _live: live,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Registers one Call per method so every method has a listener.
    pub(crate) fn seed(&mut self) {
        for method in Method::ALL {
            self.spawn(method);
        }
        debug!(queue = self.id, calls = self.calls.len(), "queue seeded");
    }

    fn spawn(&mut self, method: Method) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let slot = self.calls.insert(Entry {
            generation,
            call: Call::new(method),
        });
        let tag = Tag::new(slot, generation);
        self.transport.request_call(method, self.handle.ack(tag));
        self.calls[slot].call.registered();
        trace!(%method, slot, generation, "listening");
    }

    /// Drains events until shutdown was requested and no Call is left.
    pub(crate) fn run(mut self) {
        let span = debug_span!("queue", id = self.id);
        let _enter = span.enter();
        debug!(calls = self.calls.len(), "queue running");
        while let Some(message) = self.rx.blocking_recv() {
            match message {
                Message::Event(event) => self.dispatch(event),
                Message::Shutdown => {
                    debug!(live = self.calls.len(), "draining");
                    self.draining = true;
                }
                Message::Abort => {
                    if !self.calls.is_empty() {
                        let calls = self.calls.len();
                        warn!(calls, "abandoning live calls");
                    }
                    self.draining = true;
                    // dropping a Call releases its cursor and its responder
                    self.calls.clear();
                }
            }
            if self.draining && self.calls.is_empty() {
                break;
            }
        }
        debug!("queue drained");
    }

    fn dispatch(&mut self, event: Event) {
        let Event { tag, ok, accepted } = event;
        let method = match self.calls.get(tag.slot) {
            Some(entry) if entry.generation == tag.generation => {
                entry.call.method()
            }
            _ => {
                warn!(?tag, ok, "completion for a retired call");
                return;
            }
        };

        // a request was just accepted: put a fresh listener up before the
        // accepted one does any work
        let accepting = ok
            && accepted.is_some()
            && self.calls[tag.slot].call.state() == State::Process;
        if accepting && !self.draining {
            self.spawn(method);
        }

        let cx = Context {
            store: &self.store,
            queue: &self.handle,
            tag,
            draining: self.draining,
        };
        let step = self.calls[tag.slot].call.on_event(ok, accepted, &cx);
        if step == Step::Retire {
            self.calls.remove(tag.slot);
            trace!(%method, slot = tag.slot, "retired");
        }
    }

    #[cfg(test)]
    fn live_calls(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        net::{
            completion::Outgoing,
            wire::{Reply, Request},
            LocalTransport,
        },
        status::Status,
        store::MemoryEngine,
    };

    fn queue(transport: &LocalTransport) -> CompletionQueue {
        let live = Arc::new(watch::channel(1).0);
        CompletionQueue::new(
            0,
            Store::new(MemoryEngine::new()),
            Arc::new(transport.clone()),
            LiveGuard::new(live),
        )
    }

    fn next(queue: &mut CompletionQueue) {
        match queue.rx.try_recv() {
            Ok(Message::Event(event)) => queue.dispatch(event),
            _ => panic!("expected an event"),
        }
    }

    #[test]
    fn seeding_registers_every_method() {
        let transport = LocalTransport::new();
        let mut queue = queue(&transport);
        queue.seed();
        assert_eq!(queue.live_calls(), Method::ALL.len());
        for method in Method::ALL {
            assert_eq!(transport.listeners().pending(method), 1);
        }
    }

    #[test]
    fn accepting_a_request_replenishes_the_listener() {
        let transport = LocalTransport::new();
        let mut queue = queue(&transport);
        queue.seed();

        let mut replies = transport.call(Request::Get { key: b"k".to_vec() });
        assert_eq!(transport.listeners().pending(Method::Get), 0);
        next(&mut queue);
        assert_eq!(transport.listeners().pending(Method::Get), 1);
        assert_eq!(queue.live_calls(), Method::ALL.len() + 1);

        let Outgoing { reply, ack } = replies.try_recv().expect("reply");
        assert_eq!(
            reply,
            Reply::Get {
                status: Status::ok(),
                value: None
            }
        );
        ack.complete(true);
        next(&mut queue);
        assert_eq!(queue.live_calls(), Method::ALL.len());
    }

    #[test]
    fn stale_completions_are_ignored() {
        let transport = LocalTransport::new();
        let mut queue = queue(&transport);
        queue.seed();
        queue.handle().ack(Tag::new(0, 999)).complete(true);
        queue.handle().ack(Tag::new(4096, 0)).complete(false);
        next(&mut queue);
        next(&mut queue);
        assert_eq!(queue.live_calls(), Method::ALL.len());
    }

    #[test]
    fn shutdown_drains_every_listener() {
        let transport = LocalTransport::new();
        let mut queue = queue(&transport);
        queue.seed();
        transport.shutdown();
        assert!(queue.handle().shutdown());
        // returns once every cancelled registration has been retired
        queue.run();
    }

    #[test]
    fn abort_drops_calls_stuck_on_a_write() {
        let transport = LocalTransport::new();
        let mut queue = queue(&transport);
        assert!(queue.store.put(b"a", b"1").is_ok());
        queue.seed();

        let mut replies = transport.call(Request::Scan {
            start: None,
            limit: None,
        });
        next(&mut queue);
        // the first item is out and its ack is never completed
        let stalled = replies.try_recv().expect("first item");
        assert!(matches!(stalled.reply, Reply::Item(_)));

        transport.shutdown();
        let handle = queue.handle();
        assert!(handle.shutdown());
        assert!(handle.abort());
        queue.run();
        // the abandoned Scan went away without a close
        assert!(replies.try_recv().is_err());
        drop(stalled);
    }
}
