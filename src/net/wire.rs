use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use quinn::{ReadExactError, RecvStream, SendStream};
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};

use super::error::Error::{self, *};
use crate::{limits::MAX_FRAME_SIZE, status::Status};

/// The RPC methods a server listens for.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Method {
    Get,
    Put,
    Delete,
    Scan,
    Warmup,
}

impl Method {
    pub const ALL: [Method; 5] = [
        Method::Get,
        Method::Put,
        Method::Delete,
        Method::Scan,
        Method::Warmup,
    ];

    /// Dense index, handy for per-method tables.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Only scans answer with a stream; everything else sends one reply.
    pub fn is_streaming(self) -> bool {
        self == Method::Scan
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Kv {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Request {
    Get {
        key: Vec<u8>,
    },
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        key: Vec<u8>,
    },
    /// Streams pairs with keys `>= start` (or from the first key), stopping
    /// after `limit` items when one is given.
    Scan {
        start: Option<Vec<u8>>,
        limit: Option<u64>,
    },
    /// Carries `data` as ballast and asks for exactly `resp_size` bytes back.
    Warmup {
        data: Vec<u8>,
        resp_size: u64,
    },
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Request::Get { .. } => Method::Get,
            Request::Put { .. } => Method::Put,
            Request::Delete { .. } => Method::Delete,
            Request::Scan { .. } => Method::Scan,
            Request::Warmup { .. } => Method::Warmup,
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Reply {
    /// `value` is `None` when the key doesn't exist; the status stays OK.
    Get {
        status: Status,
        value: Option<Vec<u8>>,
    },
    Put {
        status: Status,
    },
    Delete {
        status: Status,
    },
    Warmup {
        status: Status,
        data: Vec<u8>,
    },
    /// One pair of a scan stream.
    Item(Kv),
    /// Ends a scan stream. Also sent in place of any reply when the server
    /// refuses a request outright.
    Close(Status),
}

impl Reply {
    /// True for replies after which nothing else is written to the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Reply::Item(_))
    }
}

/// A message that travels as one length-prefixed frame.
pub trait Frame: Sized {
    fn encode(&self) -> Result<AlignedVec, Error>;
    fn decode(bytes: &[u8]) -> Result<Self, Error>;
}

macro_rules! impl_frame {
    ($ty:ty) => {
        impl Frame for $ty {
            fn encode(&self) -> Result<AlignedVec, Error> {
                rkyv::to_bytes::<_, 256>(self)
                    .map_err(|_| CouldNotEncodeMessage)
            }

            fn decode(bytes: &[u8]) -> Result<Self, Error> {
                // archived roots must sit on an aligned buffer
                let mut aligned = AlignedVec::with_capacity(bytes.len());
                aligned.extend_from_slice(bytes);
                rkyv::from_bytes::<$ty>(&aligned)
                    .map_err(|_| CouldNotDecodeMessage)
            }
        }
    };
}

impl_frame!(Request);
impl_frame!(Reply);

/// Encodes `msg` as `len | payload`, the length being a little-endian `u32`.
pub fn frame<F: Frame>(msg: &F) -> Result<Vec<u8>, Error> {
    let msg = msg.encode()?;
    let len = msg.len();
    if len > MAX_FRAME_SIZE {
        Err(MessageLengthOverflowed(len))?
    }
    let mut buf = Vec::with_capacity(4 + len);
    buf.extend_from_slice(&(len as u32).to_le_bytes());
    buf.extend_from_slice(&msg);
    Ok(buf)
}

/// Parses a frame length prefix, refusing anything over `MAX_FRAME_SIZE`.
pub fn frame_len(prefix: [u8; 4]) -> Result<usize, Error> {
    let len = LittleEndian::read_u32(&prefix) as usize;
    if len > MAX_FRAME_SIZE {
        Err(MessageLengthOverflowed(len))?
    }
    Ok(len)
}

pub async fn write_frame<F: Frame>(
    stream: &mut SendStream,
    msg: &F,
) -> Result<(), Error> {
    let buf = frame(msg)?;
    stream.write_all(&buf).await?;
    Ok(())
}

/// Reads one frame. Returns `None` if the peer finished the stream cleanly
/// before another frame started.
pub async fn read_frame<F: Frame>(
    stream: &mut RecvStream,
) -> Result<Option<F>, Error> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly) => return Ok(None),
        Err(e) => Err(e)?,
    }
    let len = frame_len(len_buf)?;
    let mut msg_buf = vec![0u8; len];
    stream.read_exact(&mut msg_buf).await?;
    F::decode(&msg_buf).map(Some)
}
