use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

/// Result codes shared by the server and the client.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Code {
    Ok,
    /// The call failed on the client side, e.g. the transport broke or the
    /// request was refused before it was sent. Never produced by a server.
    ClientError,
    /// The storage backend reported a failure, or the server refused the
    /// request.
    ServerError,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::ClientError => "CLIENT_ERROR",
            Code::ServerError => "SERVER_ERROR",
        };
        f.write_str(name)
    }
}

/// Outcome of one operation. `OK` carries no message.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    Clone,
    Debug,
    PartialEq,
    Eq,
    thiserror::Error,
)]
#[archive(check_bytes)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: Code::Ok,
            message: String::new(),
        }
    }

    pub fn client_error(message: impl Into<String>) -> Self {
        Self {
            code: Code::ClientError,
            message: message.into(),
        }
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self {
            code: Code::ServerError,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Turns a status into a `Result`, keeping non-OK statuses as the error.
    pub fn into_result(self) -> Result<(), Status> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_has_no_message() {
        let status = Status::ok();
        assert!(status.is_ok());
        assert!(status.message.is_empty());
        assert_eq!(status.into_result(), Ok(()));
    }

    #[test]
    fn errors_render_code_and_message() {
        let status = Status::server_error("disk full");
        assert!(!status.is_ok());
        assert_eq!(status.to_string(), "SERVER_ERROR: disk full");
        assert_eq!(
            Status::client_error("reset").into_result(),
            Err(Status::client_error("reset"))
        );
    }
}
