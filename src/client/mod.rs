use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use futures::{stream, Stream, TryStreamExt};
use quinn::{Connection, RecvStream, VarInt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    limits::{MAX_KEY_SIZE, MAX_VALUE_SIZE, MAX_WARMUP_SIZE},
    net::{
        completion::Outgoing,
        endpoint::client_endpoint,
        error::Error,
        wire::{read_frame, write_frame, Kv, Reply, Request},
        LocalTransport, SERVER_NAME,
    },
    status::Status,
};

pub mod blocking;

pub use self::blocking::BlockingClient;

enum Channel {
    Quic {
        endpoint: quinn::Endpoint,
        conn: Connection,
    },
    Local(LocalTransport),
}

/// Replies of one RPC, in the order the server sent them.
enum Replies {
    Quic(RecvStream),
    Local(mpsc::UnboundedReceiver<Outgoing>),
}

impl Replies {
    async fn next(&mut self) -> Result<Reply, Error> {
        match self {
            Replies::Quic(recv) => {
                read_frame(recv).await?.ok_or(Error::StreamClosedEarly)
            }
            Replies::Local(rx) => {
                let Outgoing { reply, ack } =
                    rx.recv().await.ok_or(Error::StreamClosedEarly)?;
                // taking the reply is what completes its write
                ack.complete(true);
                Ok(reply)
            }
        }
    }
}

enum ScanState {
    Start(Request),
    Open(Replies),
}

/// Async client. Every operation is one RPC; failures of the transport
/// itself come back as `CLIENT_ERROR`, backend failures as the server's
/// `SERVER_ERROR`.
pub struct Client {
    channel: Channel,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self, Error> {
        let endpoint = client_endpoint(addr)?;
        let conn = endpoint.connect(addr, SERVER_NAME)?.await?;
        debug!(%addr, "connected");
        Ok(Self {
            channel: Channel::Quic { endpoint, conn },
        })
    }

    /// A client for a server running in this process.
    pub fn local(transport: &LocalTransport) -> Self {
        Self {
            channel: Channel::Local(transport.clone()),
        }
    }

    /// `Ok(None)` when the key doesn't exist.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Status> {
        check_key(key)?;
        let request = Request::Get { key: key.to_vec() };
        match self.unary(request).await? {
            Reply::Get { status, value } => status.into_result().map(|_| value),
            other => Err(unexpected(other)),
        }
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Status> {
        check_key(key)?;
        if value.len() > MAX_VALUE_SIZE {
            Err(Status::client_error(format!(
                "value of {} bytes exceeds the {MAX_VALUE_SIZE} byte limit",
                value.len()
            )))?
        }
        let request = Request::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        match self.unary(request).await? {
            Reply::Put { status } => status.into_result(),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete(&self, key: &[u8]) -> Result<(), Status> {
        check_key(key)?;
        let request = Request::Delete { key: key.to_vec() };
        match self.unary(request).await? {
            Reply::Delete { status } => status.into_result(),
            other => Err(unexpected(other)),
        }
    }

    /// Pairs with keys `>= start` in key order, at most `limit` of them. The
    /// stream ends with an error if the server closes it with one.
    pub fn scan_stream(
        &self,
        start: Option<&[u8]>,
        limit: Option<u64>,
    ) -> impl Stream<Item = Result<Kv, Status>> + '_ {
        let request = Request::Scan {
            start: start.map(<[u8]>::to_vec),
            limit,
        };
        stream::try_unfold(ScanState::Start(request), move |state| async move {
            let mut replies = match state {
                ScanState::Start(request) => {
                    self.open(request).await.map_err(client_error)?
                }
                ScanState::Open(replies) => replies,
            };
            match replies.next().await.map_err(client_error)? {
                Reply::Item(kv) => Ok(Some((kv, ScanState::Open(replies)))),
                Reply::Close(status) => status.into_result().map(|_| None),
                other => Err(unexpected(other)),
            }
        })
    }

    /// Collects a whole scan.
    pub async fn scan(
        &self,
        start: Option<&[u8]>,
        limit: Option<u64>,
    ) -> Result<Vec<Kv>, Status> {
        self.scan_stream(start, limit).try_collect().await
    }

    /// Sends `data_size` bytes of padding, asks for `resp_size` bytes back
    /// and returns how long the round trip took.
    pub async fn warmup(
        &self,
        data_size: usize,
        resp_size: usize,
    ) -> Result<Duration, Status> {
        for size in [data_size, resp_size] {
            if size > MAX_WARMUP_SIZE {
                Err(Status::client_error(format!(
                    "warmup size of {size} bytes exceeds the \
                     {MAX_WARMUP_SIZE} byte limit"
                )))?
            }
        }
        let request = Request::Warmup {
            data: vec![0u8; data_size],
            resp_size: resp_size as u64,
        };
        let started = Instant::now();
        match self.unary(request).await? {
            Reply::Warmup { status, data } => {
                status.into_result()?;
                if data.len() != resp_size {
                    Err(Status::client_error(format!(
                        "asked for {resp_size} bytes, got {}",
                        data.len()
                    )))?
                }
                Ok(started.elapsed())
            }
            other => Err(unexpected(other)),
        }
    }

    /// Closes the connection and waits for the peer to hear about it.
    pub async fn close(self) {
        if let Channel::Quic { endpoint, conn } = self.channel {
            conn.close(VarInt::from_u32(0), b"client done");
            endpoint.wait_idle().await;
        }
    }

    async fn open(&self, request: Request) -> Result<Replies, Error> {
        match &self.channel {
            Channel::Quic { conn, .. } => {
                let (mut send, recv) = conn.open_bi().await?;
                write_frame(&mut send, &request).await?;
                send.finish().await?;
                Ok(Replies::Quic(recv))
            }
            Channel::Local(transport) => {
                Ok(Replies::Local(transport.call(request)))
            }
        }
    }

    async fn unary(&self, request: Request) -> Result<Reply, Status> {
        let mut replies = self.open(request).await.map_err(client_error)?;
        replies.next().await.map_err(client_error)
    }
}

fn check_key(key: &[u8]) -> Result<(), Status> {
    if key.len() > MAX_KEY_SIZE {
        Err(Status::client_error(format!(
            "key of {} bytes exceeds the {MAX_KEY_SIZE} byte limit",
            key.len()
        )))?
    }
    Ok(())
}

fn client_error(e: Error) -> Status {
    Status::client_error(e.to_string())
}

/// A reply of the wrong shape. A server that refuses a request answers with
/// a `Close`, whose status is passed through.
fn unexpected(reply: Reply) -> Status {
    match reply {
        Reply::Close(status) if !status.is_ok() => status,
        other => Status::client_error(format!("unexpected reply {other:?}")),
    }
}
