use std::{
    net::{Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use typed_builder::TypedBuilder;

/// Port the server listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 12345;

/// Where the persistent engine keeps its file unless told otherwise.
pub const DEFAULT_DB_FILE: &str = "/tmp/kvrpc.redb";

/// How long a stop waits for in-flight Calls before abandoning them.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Which storage engine backs the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EngineKind {
    /// Ordered in-memory map; contents vanish with the process.
    Memory,
    /// On-disk redb database at `ServerConfig::db_path`.
    #[default]
    Redb,
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(EngineKind::Memory),
            "redb" => Ok(EngineKind::Redb),
            other => Err(format!("unknown engine `{other}`")),
        }
    }
}

#[derive(Clone, Debug, TypedBuilder)]
pub struct ServerConfig {
    /// Number of dispatch queues, each drained by its own worker thread.
    #[builder(default = default_queues())]
    pub queues: usize,
    #[builder(
        default = SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT))
    )]
    pub listen: SocketAddr,
    #[builder(default)]
    pub engine: EngineKind,
    #[builder(default = PathBuf::from(DEFAULT_DB_FILE), setter(into))]
    pub db_path: PathBuf,
    /// After this long, Calls still blocked on a write are abandoned so the
    /// queues can exit.
    #[builder(default = DEFAULT_SHUTDOWN_GRACE)]
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn default_queues() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}
