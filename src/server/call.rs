use tracing::{debug, trace, warn};

use crate::{
    hex::HexDisplayExt,
    limits::MAX_WARMUP_SIZE,
    net::{
        completion::{Accepted, Ack, QueueHandle, Responder, Tag},
        listeners::SHUTTING_DOWN,
        wire::{Kv, Method, Reply, Request},
    },
    status::Status,
    store::{Cursor, Store},
};

/// Where a Call is in its life. States only ever move forward:
/// `Create -> Process -> (Writing)* -> Finish`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// Built, not yet registered with the transport.
    Create,
    /// Registered; the next event delivers the request.
    Process,
    /// Streaming; the next event completes the write of one item.
    Writing,
    /// The final reply was handed to the transport; the next event retires
    /// the Call.
    Finish,
}

/// What the queue does with a Call after feeding it an event.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    Retire,
}

/// Everything a Call may touch while handling one event.
pub struct Context<'a> {
    pub store: &'a Store,
    pub queue: &'a QueueHandle,
    pub tag: Tag,
    /// The owning queue is shutting down.
    pub draining: bool,
}

impl Context<'_> {
    fn ack(&self) -> Ack {
        self.queue.ack(self.tag)
    }
}

/// One in-flight RPC. Unary methods share a shape; scans stream.
pub enum Call {
    Unary(UnaryCall),
    Scan(ScanCall),
}

impl Call {
    pub fn new(method: Method) -> Self {
        if method.is_streaming() {
            Call::Scan(ScanCall {
                state: State::Create,
                stream: None,
            })
        } else {
            Call::Unary(UnaryCall {
                method,
                state: State::Create,
            })
        }
    }

    pub fn method(&self) -> Method {
        match self {
            Call::Unary(call) => call.method,
            Call::Scan(_) => Method::Scan,
        }
    }

    pub fn state(&self) -> State {
        match self {
            Call::Unary(call) => call.state,
            Call::Scan(call) => call.state,
        }
    }

    /// Records that the Call's acceptance is registered with the transport.
    pub fn registered(&mut self) {
        let state = match self {
            Call::Unary(call) => &mut call.state,
            Call::Scan(call) => &mut call.state,
        };
        debug_assert_eq!(*state, State::Create);
        *state = State::Process;
    }

    /// Feeds the outcome of the Call's last async action.
    pub fn on_event(
        &mut self,
        ok: bool,
        accepted: Option<Accepted>,
        cx: &Context<'_>,
    ) -> Step {
        match self {
            Call::Unary(call) => call.on_event(ok, accepted, cx),
            Call::Scan(call) => call.on_event(ok, accepted, cx),
        }
    }
}

/// Get, Put, Delete and Warmup: one request, one reply.
pub struct UnaryCall {
    method: Method,
    state: State,
}

impl UnaryCall {
    fn on_event(
        &mut self,
        ok: bool,
        accepted: Option<Accepted>,
        cx: &Context<'_>,
    ) -> Step {
        match self.state {
            State::Process => {
                let Some(Accepted { request, responder }) =
                    accepted.filter(|_| ok)
                else {
                    trace!(method = %self.method, "registration cancelled");
                    return Step::Retire;
                };
                let reply = self.process(request, cx.store);
                self.state = State::Finish;
                responder.send(reply, cx.ack());
                Step::Continue
            }
            State::Finish => {
                if !ok {
                    debug!(method = %self.method, "reply was not delivered");
                }
                Step::Retire
            }
            state => {
                warn!(method = %self.method, ?state, "unexpected event");
                Step::Retire
            }
        }
    }

    fn process(&self, request: Request, store: &Store) -> Reply {
        match request {
            Request::Get { key } => {
                let (value, status) = store.get(&key);
                trace!(
                    key = %key.hex(),
                    found = value.is_some(),
                    %status,
                    "get"
                );
                Reply::Get { status, value }
            }
            Request::Put { key, value } => {
                let status = store.put(&key, &value);
                trace!(key = %key.hex(), len = value.len(), %status, "put");
                Reply::Put { status }
            }
            Request::Delete { key } => {
                let status = store.delete(&key);
                trace!(key = %key.hex(), %status, "delete");
                Reply::Delete { status }
            }
            Request::Warmup { data, resp_size } => {
                warmup(data.len(), resp_size)
            }
            Request::Scan { .. } => {
                warn!(method = %self.method, "scan delivered to a unary call");
                Reply::Close(Status::server_error("scan is a streaming method"))
            }
        }
    }
}

/// Answers a warmup with exactly `resp_size` bytes. Sizes above the ceiling
/// are refused rather than clamped.
fn warmup(data_len: usize, resp_size: u64) -> Reply {
    let too_big = |what: &str, size: u64| Reply::Warmup {
        status: Status::server_error(format!(
            "warmup {what} of {size} bytes exceeds the \
             {MAX_WARMUP_SIZE} byte limit"
        )),
        data: Vec::new(),
    };
    if data_len > MAX_WARMUP_SIZE {
        return too_big("payload", data_len as u64);
    }
    match usize::try_from(resp_size) {
        Ok(size) if size <= MAX_WARMUP_SIZE => Reply::Warmup {
            status: Status::ok(),
            data: vec![0u8; size],
        },
        _ => too_big("response", resp_size),
    }
}

/// Cursor and write budget of a running scan.
struct Stream {
    responder: Responder,
    cursor: Box<dyn Cursor>,
    remaining: u64,
}

/// Streams pairs in key order, one write in flight at a time.
pub struct ScanCall {
    state: State,
    /// Present while `Writing`. Dropped, cursor and all, once the closing
    /// reply is handed over.
    stream: Option<Stream>,
}

impl ScanCall {
    fn on_event(
        &mut self,
        ok: bool,
        accepted: Option<Accepted>,
        cx: &Context<'_>,
    ) -> Step {
        match self.state {
            State::Process => {
                let Some(Accepted { request, responder }) =
                    accepted.filter(|_| ok)
                else {
                    trace!("scan registration cancelled");
                    return Step::Retire;
                };
                self.start(request, responder, cx);
                Step::Continue
            }
            State::Writing if ok => {
                if let Some(stream) = self.stream.as_mut() {
                    stream.cursor.next();
                }
                self.write_next(cx);
                Step::Continue
            }
            State::Writing => {
                debug!("scan item was not delivered, abandoning stream");
                self.stream = None;
                Step::Retire
            }
            State::Finish => {
                if !ok {
                    debug!("scan close was not delivered");
                }
                Step::Retire
            }
            State::Create => {
                warn!("event for an unregistered scan");
                Step::Retire
            }
        }
    }

    fn start(
        &mut self,
        request: Request,
        responder: Responder,
        cx: &Context<'_>,
    ) {
        let Request::Scan { start, limit } = request else {
            warn!("unary request delivered to a scan call");
            self.close(
                responder,
                Status::server_error("not a scan request"),
                cx,
            );
            return;
        };
        let mut cursor = match cx.store.open_cursor() {
            Ok(cursor) => cursor,
            Err(status) => {
                self.close(responder, status, cx);
                return;
            }
        };
        match &start {
            Some(key) => cursor.seek_to(key),
            None => cursor.seek_first(),
        }
        debug!(
            start = ?start.as_ref().map(|k| k.hex()),
            ?limit,
            "scan started"
        );
        self.state = State::Writing;
        self.stream = Some(Stream {
            responder,
            cursor,
            remaining: limit.unwrap_or(u64::MAX),
        });
        self.write_next(cx);
    }

    /// Writes the item under the cursor, or closes the stream once the cursor
    /// is spent, the limit is reached, the cursor failed or the queue is
    /// draining.
    fn write_next(&mut self, cx: &Context<'_>) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let closing = if cx.draining {
            Some(Status::server_error(SHUTTING_DOWN))
        } else if let Err(e) = stream.cursor.status() {
            warn!("scan cursor failed: {e}");
            Some(Status::server_error(e.to_string()))
        } else if stream.remaining == 0 || !stream.cursor.valid() {
            Some(Status::ok())
        } else {
            None
        };

        match closing {
            Some(status) => {
                if let Some(Stream {
                    responder, cursor, ..
                }) = self.stream.take()
                {
                    // release the cursor before the caller can see the close
                    drop(cursor);
                    self.close(responder, status, cx);
                }
            }
            None => {
                stream.remaining -= 1;
                let item = Kv {
                    key: stream.cursor.key().to_vec(),
                    value: stream.cursor.value().to_vec(),
                };
                stream.responder.send(Reply::Item(item), cx.ack());
            }
        }
    }

    fn close(
        &mut self,
        responder: Responder,
        status: Status,
        cx: &Context<'_>,
    ) {
        trace!(%status, "scan closing");
        self.state = State::Finish;
        responder.send(Reply::Close(status), cx.ack());
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        net::completion::{Message, Outgoing},
        store::{Engine, MemoryEngine},
    };

    struct Harness {
        store: Store,
        engine: MemoryEngine,
        queue: QueueHandle,
        events: mpsc::UnboundedReceiver<Message>,
    }

    impl Harness {
        fn new() -> Self {
            let engine = MemoryEngine::new();
            let store = Store::new(engine.clone());
            let (queue, events) = QueueHandle::channel(0);
            Self {
                store,
                engine,
                queue,
                events,
            }
        }

        fn cx(&self, draining: bool) -> Context<'_> {
            Context {
                store: &self.store,
                queue: &self.queue,
                tag: Tag::new(0, 0),
                draining,
            }
        }

        /// Delivers `request` to a fresh, registered Call.
        fn start(
            &self,
            request: Request,
        ) -> (Call, mpsc::UnboundedReceiver<Outgoing>) {
            let mut call = Call::new(request.method());
            call.registered();
            let (tx, rx) = mpsc::unbounded_channel();
            let accepted = Accepted {
                request,
                responder: Responder::new(tx),
            };
            let step = call.on_event(true, Some(accepted), &self.cx(false));
            assert_eq!(step, Step::Continue);
            (call, rx)
        }
    }

    fn take(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Reply {
        let Outgoing { reply, ack } = rx.try_recv().expect("a reply");
        // the test plays the transport: the write "succeeded"
        std::mem::forget(ack);
        reply
    }

    #[test]
    fn states_move_forward() {
        let harness = Harness::new();
        let mut call = Call::new(Method::Put);
        assert_eq!(call.state(), State::Create);
        call.registered();
        assert_eq!(call.state(), State::Process);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let accepted = Accepted {
            request: Request::Put {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            },
            responder: Responder::new(tx),
        };
        assert_eq!(
            call.on_event(true, Some(accepted), &harness.cx(false)),
            Step::Continue
        );
        assert_eq!(call.state(), State::Finish);
        assert_eq!(
            take(&mut rx),
            Reply::Put {
                status: Status::ok()
            }
        );
        assert_eq!(call.on_event(true, None, &harness.cx(false)), Step::Retire);
        assert_eq!(harness.engine.len(), 1);
    }

    #[test]
    fn failed_registration_retires_without_reply() {
        let harness = Harness::new();
        let mut call = Call::new(Method::Get);
        call.registered();
        assert_eq!(call.on_event(false, None, &harness.cx(true)), Step::Retire);
    }

    #[test]
    fn get_of_missing_key_is_ok_and_empty() {
        let harness = Harness::new();
        let (_call, mut rx) = harness.start(Request::Get {
            key: b"absent".to_vec(),
        });
        assert_eq!(
            take(&mut rx),
            Reply::Get {
                status: Status::ok(),
                value: None
            }
        );
    }

    #[test]
    fn warmup_sizes() {
        for size in [0, 1, 4096, MAX_WARMUP_SIZE as u64] {
            match warmup(0, size) {
                Reply::Warmup { status, data } => {
                    assert!(status.is_ok());
                    assert_eq!(data.len() as u64, size);
                }
                other => panic!("unexpected reply {other:?}"),
            }
        }
        match warmup(0, MAX_WARMUP_SIZE as u64 + 1) {
            Reply::Warmup { status, data } => {
                assert!(!status.is_ok());
                assert!(data.is_empty());
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(matches!(
            warmup(MAX_WARMUP_SIZE + 1, 0),
            Reply::Warmup { status, .. } if !status.is_ok()
        ));
    }

    #[test]
    fn scan_writes_one_item_per_event() {
        let mut harness = Harness::new();
        for key in [b"a", b"b", b"c"] {
            harness.engine.put(key, key).unwrap();
        }
        let (mut call, mut rx) = harness.start(Request::Scan {
            start: Some(b"b".to_vec()),
            limit: None,
        });
        assert_eq!(call.state(), State::Writing);
        assert_eq!(
            take(&mut rx),
            Reply::Item(Kv {
                key: b"b".to_vec(),
                value: b"b".to_vec()
            })
        );
        // nothing else until the first write completes
        assert!(rx.try_recv().is_err());

        call.on_event(true, None, &harness.cx(false));
        assert!(matches!(take(&mut rx), Reply::Item(kv) if kv.key == b"c"));
        call.on_event(true, None, &harness.cx(false));
        assert_eq!(take(&mut rx), Reply::Close(Status::ok()));
        assert_eq!(call.state(), State::Finish);
        assert_eq!(harness.engine.open_cursors(), 0);
        assert_eq!(call.on_event(true, None, &harness.cx(false)), Step::Retire);
        assert!(harness.events.try_recv().is_err());
    }

    #[test]
    fn scan_limit_zero_closes_immediately() {
        let harness = Harness::new();
        harness.engine.put(b"a", b"1").unwrap();
        let (call, mut rx) = harness.start(Request::Scan {
            start: None,
            limit: Some(0),
        });
        assert_eq!(take(&mut rx), Reply::Close(Status::ok()));
        assert_eq!(call.state(), State::Finish);
    }

    #[test]
    fn draining_scan_closes_with_error_and_releases_cursor() {
        let harness = Harness::new();
        harness.engine.put(b"a", b"1").unwrap();
        harness.engine.put(b"b", b"2").unwrap();
        let (mut call, mut rx) = harness.start(Request::Scan {
            start: None,
            limit: None,
        });
        assert!(matches!(take(&mut rx), Reply::Item(_)));
        assert_eq!(harness.engine.open_cursors(), 1);

        call.on_event(true, None, &harness.cx(true));
        assert_eq!(
            take(&mut rx),
            Reply::Close(Status::server_error(SHUTTING_DOWN))
        );
        assert_eq!(harness.engine.open_cursors(), 0);
    }

    #[test]
    fn failed_write_abandons_the_scan() {
        let harness = Harness::new();
        harness.engine.put(b"a", b"1").unwrap();
        let (mut call, mut rx) = harness.start(Request::Scan {
            start: None,
            limit: None,
        });
        assert!(matches!(take(&mut rx), Reply::Item(_)));
        assert_eq!(
            call.on_event(false, None, &harness.cx(false)),
            Step::Retire
        );
        assert_eq!(harness.engine.open_cursors(), 0);
    }

    #[test]
    fn cursor_failure_closes_with_server_error() {
        let harness = Harness::new();
        harness.engine.put(b"a", b"1").unwrap();
        harness.engine.put(b"b", b"2").unwrap();
        let (mut call, mut rx) = harness.start(Request::Scan {
            start: None,
            limit: None,
        });
        assert!(matches!(take(&mut rx), Reply::Item(_)));

        harness.engine.close().unwrap();
        call.on_event(true, None, &harness.cx(false));
        match take(&mut rx) {
            Reply::Close(status) => {
                assert_eq!(status, Status::server_error("store is closed"))
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }
}
