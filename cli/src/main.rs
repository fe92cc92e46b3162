use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kvrpc::{
    client::BlockingClient,
    config::{EngineKind, ServerConfig, DEFAULT_DB_FILE, DEFAULT_PORT},
    net::{ip_addr_to_socket_addr, QuicTransport},
    server::Server,
    store::Store,
};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod bench;

#[derive(Parser, Debug)]
#[command(name = "kvrpc")]
#[command(about = "Key-value store served over QUIC")]
struct Cli {
    /// Address to listen on, or of the server to talk to
    #[arg(long, env = "KVRPC_ADDR", default_value = "0.0.0.0")]
    addr: IpAddr,

    #[arg(long, env = "KVRPC_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server until SIGINT or SIGTERM
    Serve {
        #[arg(long, env = "KVRPC_DB_FILE", default_value = DEFAULT_DB_FILE)]
        db_file: PathBuf,
        /// Dispatch queues; defaults to the number of CPUs
        #[arg(long, env = "KVRPC_QUEUES")]
        queues: Option<usize>,
        /// Storage engine: redb or memory
        #[arg(long, env = "KVRPC_ENGINE", default_value = "redb")]
        engine: EngineKind,
        /// Seconds a stop waits for in-flight calls before abandoning them
        #[arg(long, env = "KVRPC_SHUTDOWN_GRACE", default_value_t = 5)]
        shutdown_grace: u64,
    },
    Put {
        key: String,
        value: String,
    },
    Get {
        key: String,
    },
    Delete {
        key: String,
    },
    /// Print pairs in key order
    Scan {
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Throughput loops against a running server
    Bench(bench::BenchArgs),
}

impl Cli {
    /// Where clients connect. An unspecified listen address means this host.
    fn remote(&self) -> SocketAddr {
        let ip = if self.addr.is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.addr
        };
        ip_addr_to_socket_addr(ip, self.port)
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Command::Serve {
            db_file,
            queues,
            engine,
            shutdown_grace,
        } => {
            let mut config = ServerConfig::builder()
                .listen(ip_addr_to_socket_addr(cli.addr, cli.port))
                .engine(*engine)
                .db_path(db_file.clone())
                .shutdown_grace(Duration::from_secs(*shutdown_grace))
                .build();
            if let Some(queues) = queues {
                config.queues = *queues;
            }
            serve(config)
        }
        Command::Put { key, value } => {
            let client = connect(&cli)?;
            client.put(key.as_bytes(), value.as_bytes())?;
            info!(%key, "stored");
            Ok(())
        }
        Command::Get { key } => {
            let client = connect(&cli)?;
            match client.get(key.as_bytes())? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => bail!("key `{key}` not found"),
            }
            Ok(())
        }
        Command::Delete { key } => {
            let client = connect(&cli)?;
            client.delete(key.as_bytes())?;
            info!(%key, "deleted");
            Ok(())
        }
        Command::Scan { start, limit } => {
            let client = connect(&cli)?;
            let kvs = client.scan(start.as_deref().map(str::as_bytes), *limit)?;
            for kv in &kvs {
                println!(
                    "{}\t{}",
                    String::from_utf8_lossy(&kv.key),
                    String::from_utf8_lossy(&kv.value)
                );
            }
            info!(count = kvs.len(), "scan finished");
            Ok(())
        }
        Command::Bench(args) => {
            let client = connect(&cli)?;
            bench::run(&client, args)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,quinn_udp=error"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn connect(cli: &Cli) -> Result<BlockingClient> {
    let remote = cli.remote();
    BlockingClient::connect(remote)
        .with_context(|| format!("could not connect to {remote}"))
}

/// Runs the server on this thread. A signal task on the runtime stops it.
fn serve(config: ServerConfig) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let _guard = rt.enter();

    let store = Store::open(&config)
        .with_context(|| format!("opening {:?} store", config.engine))?;
    let transport = QuicTransport::bind(config.listen)?;
    let server = Server::new(&config, store, transport)?;
    let handle = server.handle();
    info!(
        listen = %config.listen,
        queues = config.queues,
        db = %config.db_path.display(),
        "server starting"
    );

    let stopper = {
        let handle = handle.clone();
        rt.spawn(async move {
            shutdown_signal().await;
            handle.stop().await;
        })
    };

    let result = server.run();
    // every worker is gone by now, whether a signal stopped them or not; stop
    // finishes whatever closing is left
    stopper.abort();
    rt.block_on(handle.stop());
    result.map_err(Into::into)
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!("failed to install SIGTERM handler: {err}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
