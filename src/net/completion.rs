// Completion plumbing between the transport and the dispatch queues.
//
// Every async action a Call starts (waiting for a request, sending a reply,
// writing a stream item) is represented by exactly one `Ack`. Whoever carries
// the action out completes the ack, which posts a `(tag, ok)` event to the
// queue that owns the Call. An ack that is dropped unfinished posts
// `(tag, false)`, so a Call is always told how its action ended, even when the
// connection, the writer task or the transport itself goes away.

use tokio::sync::mpsc;
use tracing::trace;

use super::wire::{Reply, Request};

/// Names one Call inside one queue's arena. The generation tells apart Calls
/// that reused the same slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tag {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
}

impl Tag {
    pub(crate) fn new(slot: usize, generation: u64) -> Self {
        Self { slot, generation }
    }
}

/// A request handed over by the transport, along with the way back to the
/// caller.
pub struct Accepted {
    pub request: Request,
    pub responder: Responder,
}

pub struct Event {
    pub tag: Tag,
    pub ok: bool,
    /// Present only on the event that completes a request registration.
    pub accepted: Option<Accepted>,
}

pub(crate) enum Message {
    Event(Event),
    Shutdown,
    /// Drop every live Call without waiting for its pending action.
    Abort,
}

/// Sending side of one dispatch queue. Cheap to clone; held by acks and by the
/// queue itself.
#[derive(Clone)]
pub struct QueueHandle {
    id: usize,
    tx: mpsc::UnboundedSender<Message>,
}

impl QueueHandle {
    pub(crate) fn channel(
        id: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Hands out the completion ticket for the next action of the Call `tag`.
    pub fn ack(&self, tag: Tag) -> Ack {
        Ack {
            target: Some((self.clone(), tag)),
        }
    }

    /// Tells the queue to drain and stop. Returns false if the queue is gone.
    pub fn shutdown(&self) -> bool {
        self.tx.send(Message::Shutdown).is_ok()
    }

    /// Tells the queue to give up on its live Calls and stop. Returns false
    /// if the queue is gone.
    pub fn abort(&self) -> bool {
        self.tx.send(Message::Abort).is_ok()
    }

    fn post(&self, event: Event) {
        // a closed queue has already exited; nothing is left to notify
        if self.tx.send(Message::Event(event)).is_err() {
            trace!(queue = self.id, "dropped completion for exited queue");
        }
    }
}

/// Completion ticket for one outstanding action. See the module notes.
pub struct Ack {
    target: Option<(QueueHandle, Tag)>,
}

impl Ack {
    /// An ack owned by no queue. Completing or dropping it does nothing.
    pub fn detached() -> Self {
        Self { target: None }
    }

    pub fn tag(&self) -> Option<Tag> {
        self.target.as_ref().map(|(_, tag)| *tag)
    }

    /// Reports the outcome of a send or write.
    pub fn complete(mut self, ok: bool) {
        self.fire(ok, None);
    }

    /// Completes a request registration by delivering the request.
    pub fn accept(mut self, accepted: Accepted) {
        self.fire(true, Some(accepted));
    }

    fn fire(&mut self, ok: bool, accepted: Option<Accepted>) {
        if let Some((queue, tag)) = self.target.take() {
            queue.post(Event { tag, ok, accepted });
        }
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        self.fire(false, None);
    }
}

/// A reply on its way to the caller, together with the ack to complete once
/// the transport has written it.
pub struct Outgoing {
    pub reply: Reply,
    pub ack: Ack,
}

/// The way back to the caller of one request. Replies are written in the order
/// they are sent.
pub struct Responder {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Responder {
    pub fn new(tx: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self { tx }
    }

    pub fn send(&self, reply: Reply, ack: Ack) {
        // if the writer is gone the rejected message drops here, and its ack
        // reports the failure
        let _ = self.tx.send(Outgoing { reply, ack });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;

    fn next_event(rx: &mut mpsc::UnboundedReceiver<Message>) -> Event {
        match rx.try_recv() {
            Ok(Message::Event(event)) => event,
            Ok(_) => panic!("unexpected control message"),
            Err(e) => panic!("no event: {e}"),
        }
    }

    #[test]
    fn completing_posts_one_event() {
        let (queue, mut rx) = QueueHandle::channel(0);
        let tag = Tag::new(3, 9);
        let ack = queue.ack(tag);
        assert_eq!(ack.tag(), Some(tag));
        ack.complete(true);

        let event = next_event(&mut rx);
        assert_eq!(event.tag, tag);
        assert!(event.ok);
        assert!(event.accepted.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_ack_reports_failure() {
        let (queue, mut rx) = QueueHandle::channel(1);
        drop(queue.ack(Tag::new(0, 0)));
        let event = next_event(&mut rx);
        assert!(!event.ok);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn responder_without_writer_fails_the_ack() {
        let (queue, mut rx) = QueueHandle::channel(2);
        let (tx, writer) = mpsc::unbounded_channel();
        drop(writer);
        let responder = Responder::new(tx);
        responder.send(Reply::Close(Status::ok()), queue.ack(Tag::new(1, 1)));
        assert!(!next_event(&mut rx).ok);
    }

    #[test]
    fn accept_delivers_the_request() {
        let (queue, mut rx) = QueueHandle::channel(0);
        let (tx, _writer) = mpsc::unbounded_channel();
        queue.ack(Tag::new(0, 1)).accept(Accepted {
            request: Request::Get { key: b"k".to_vec() },
            responder: Responder::new(tx),
        });
        let event = next_event(&mut rx);
        assert!(event.ok);
        let accepted = event.accepted.expect("request delivered");
        assert_eq!(accepted.request, Request::Get { key: b"k".to_vec() });
    }

    #[test]
    fn shutdown_and_abort_are_messages() {
        let (queue, mut rx) = QueueHandle::channel(0);
        assert!(queue.shutdown());
        assert!(queue.abort());
        assert!(matches!(rx.try_recv(), Ok(Message::Shutdown)));
        assert!(matches!(rx.try_recv(), Ok(Message::Abort)));
        drop(rx);
        assert!(!queue.shutdown());
        assert!(!queue.abort());
    }
}
