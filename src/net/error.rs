use std::io;

use quinn::{ConnectError, ConnectionError, ReadExactError, WriteError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connect: {0}")]
    ConnectError(#[from] ConnectError),
    #[error("connection: {0}")]
    ConnectionError(#[from] ConnectionError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("write: {0}")]
    WriteError(#[from] WriteError),
    #[error("read: {0}")]
    ReadExactError(#[from] ReadExactError),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("certificate: {0}")]
    Certificate(String),
    #[error("could not encode message")]
    CouldNotEncodeMessage,
    #[error("could not decode message")]
    CouldNotDecodeMessage,
    #[error("frame of {0} bytes exceeds the frame limit")]
    MessageLengthOverflowed(usize),
    #[error("stream closed before the reply arrived")]
    StreamClosedEarly,
}
