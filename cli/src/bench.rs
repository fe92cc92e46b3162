use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use clap::{Args, ValueEnum};
use kvrpc::{client::BlockingClient, net::Kv};
use rand::{distributions::Alphanumeric, Rng};
use tracing::info;

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Workload {
    /// Insert `batch_size` random pairs
    Put,
    /// Scan up to `batch_size` pairs, then read each back with a get
    Get,
    /// Scan up to `batch_size` pairs in one stream
    Scan,
    /// Scan up to `batch_size` pairs, then delete each
    Delete,
    /// `batch_size` warmup round trips of `val_size` bytes each way
    Warmup,
}

#[derive(Args, Debug)]
pub struct BenchArgs {
    #[arg(value_enum, default_value = "put")]
    workload: Workload,

    /// Key size in bytes
    #[arg(long, env = "KVRPC_KEY_SIZE", default_value_t = 128)]
    key_size: usize,

    /// Value size in bytes; the upper bound when `--variable` is on
    #[arg(long, env = "KVRPC_VAL_SIZE", default_value_t = 4096)]
    val_size: usize,

    #[arg(long, env = "KVRPC_BATCH_SIZE", default_value_t = 10_000)]
    batch_size: usize,

    /// Draw each value size uniformly from 1..=val_size
    #[arg(
        long,
        env = "KVRPC_VARIABLE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    variable: bool,

    #[arg(long, env = "KVRPC_REPEAT", default_value_t = 1)]
    repeat: usize,

    /// Warmup round trips before the measured rounds
    #[arg(long, env = "KVRPC_WARMUP", default_value_t = 100)]
    warmup: usize,
}

pub fn run(client: &BlockingClient, args: &BenchArgs) -> Result<()> {
    if args.warmup > 0 {
        let mut total = Duration::ZERO;
        for _ in 0..args.warmup {
            total += client.warmup(64, 64)?;
        }
        info!(
            rounds = args.warmup,
            avg_us = (total / args.warmup as u32).as_micros() as u64,
            "warmed up"
        );
    }
    for round in 0..args.repeat {
        info!(round, workload = ?args.workload, "starting round");
        let report = match args.workload {
            Workload::Put => put(client, args)?,
            Workload::Get => get(client, args)?,
            Workload::Scan => scan(client, args)?,
            Workload::Delete => delete(client, args)?,
            Workload::Warmup => warmup(client, args)?,
        };
        report.log(args.workload);
    }
    Ok(())
}

struct Report {
    count: usize,
    bytes: usize,
    elapsed: Duration,
}

impl Report {
    fn log(&self, workload: Workload) {
        let ms = self.elapsed.as_secs_f64() * 1000.0;
        let per_sec = if ms > 0.0 {
            self.count as f64 / (ms / 1000.0)
        } else {
            0.0
        };
        info!(
            ?workload,
            count = self.count,
            mb = format!("{:.2}", self.bytes as f64 / 1024.0 / 1024.0),
            ms = format!("{ms:.1}"),
            ops_per_sec = format!("{per_sec:.0}"),
            "round finished"
        );
    }
}

fn random_key(len: usize) -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .collect()
}

fn put(client: &BlockingClient, args: &BenchArgs) -> Result<Report> {
    let mut rng = rand::thread_rng();
    let reqs: Vec<(Vec<u8>, Vec<u8>)> = (0..args.batch_size)
        .map(|_| {
            let len = if args.variable && args.val_size > 0 {
                rng.gen_range(1..=args.val_size)
            } else {
                args.val_size
            };
            (random_key(args.key_size), vec![0u8; len])
        })
        .collect();
    let bytes = reqs.iter().map(|(k, v)| k.len() + v.len()).sum();

    let started = Instant::now();
    for (key, value) in &reqs {
        client.put(key, value).context("put failed")?;
    }
    Ok(Report {
        count: reqs.len(),
        bytes,
        elapsed: started.elapsed(),
    })
}

fn fetch(client: &BlockingClient, args: &BenchArgs) -> Result<Vec<Kv>> {
    client
        .scan(None, Some(args.batch_size as u64))
        .context("scan failed")
}

fn kv_bytes(kvs: &[Kv]) -> usize {
    kvs.iter().map(|kv| kv.key.len() + kv.value.len()).sum()
}

fn get(client: &BlockingClient, args: &BenchArgs) -> Result<Report> {
    let kvs = fetch(client, args)?;
    let started = Instant::now();
    for kv in &kvs {
        let value = client.get(&kv.key).context("get failed")?;
        ensure!(
            value.as_deref() == Some(kv.value.as_slice()),
            "value changed between scan and get"
        );
    }
    Ok(Report {
        count: kvs.len(),
        bytes: kv_bytes(&kvs),
        elapsed: started.elapsed(),
    })
}

fn scan(client: &BlockingClient, args: &BenchArgs) -> Result<Report> {
    let started = Instant::now();
    let kvs = fetch(client, args)?;
    Ok(Report {
        count: kvs.len(),
        bytes: kv_bytes(&kvs),
        elapsed: started.elapsed(),
    })
}

fn delete(client: &BlockingClient, args: &BenchArgs) -> Result<Report> {
    let kvs = fetch(client, args)?;
    let started = Instant::now();
    for kv in &kvs {
        client.delete(&kv.key).context("delete failed")?;
    }
    Ok(Report {
        count: kvs.len(),
        bytes: kv_bytes(&kvs),
        elapsed: started.elapsed(),
    })
}

fn warmup(client: &BlockingClient, args: &BenchArgs) -> Result<Report> {
    let started = Instant::now();
    for _ in 0..args.batch_size {
        client
            .warmup(args.val_size, args.val_size)
            .context("warmup failed")?;
    }
    Ok(Report {
        count: args.batch_size,
        bytes: 2 * args.batch_size * args.val_size,
        elapsed: started.elapsed(),
    })
}
