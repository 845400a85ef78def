//! Tail a bucket's DCP change stream to stdout.
//!
//! The smallest useful consumer: connects, streams either the whole
//! history or only new changes, prints one line per document event,
//! and shuts down cleanly on ctrl-c (or once history is drained with
//! `--up-to-now`).
//!
//! ```text
//! dcptail --seed 127.0.0.1 --bucket travel-sample --user admin --password secret
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dcp_client::{
    Client, ClientConfig, DatabaseChangeListener, Deletion, Mutation, StaticCredentials,
    StreamEnd, StreamFailure, StreamFrom, StreamTo,
};

/// Tail a Couchbase bucket's change stream.
#[derive(Parser)]
#[command(name = "dcptail", version, about = "Tail a bucket's DCP change stream")]
struct Args {
    /// Seed node, host or host:port. Repeatable.
    #[arg(long = "seed", value_name = "HOST[:PORT]", required = true)]
    seeds: Vec<String>,

    /// Bucket to stream
    #[arg(long)]
    bucket: String,

    /// Username
    #[arg(long)]
    user: String,

    /// Password
    #[arg(long)]
    password: String,

    /// Stream from the beginning of history instead of from now
    #[arg(long)]
    from_beginning: bool,

    /// Stop once the history current at connect time is drained
    #[arg(long)]
    up_to_now: bool,

    /// Restrict to specific vbuckets (default: all)
    #[arg(long = "vbucket", value_name = "ID")]
    vbuckets: Vec<u16>,

    /// Print document content sizes instead of just keys
    #[arg(short = 'v', long)]
    verbose: bool,
}

struct PrintingListener {
    verbose: bool,
    mutations: AtomicU64,
    deletions: AtomicU64,
}

impl DatabaseChangeListener for PrintingListener {
    fn on_mutation(&self, mutation: Mutation) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
        if self.verbose {
            println!(
                "MUT vb={:04} seqno={} cas={:#x} {} ({} bytes)",
                mutation.vbucket,
                mutation.offset.seqno,
                mutation.cas,
                mutation.key_string(),
                mutation.content.len()
            );
        } else {
            println!("MUT {}", mutation.key_string());
        }
        mutation.flow_control_ack();
    }

    fn on_deletion(&self, deletion: Deletion) {
        self.deletions.fetch_add(1, Ordering::Relaxed);
        let tag = if deletion.due_to_expiration { "EXP" } else { "DEL" };
        if self.verbose {
            println!(
                "{} vb={:04} seqno={} {}",
                tag,
                deletion.vbucket,
                deletion.offset.seqno,
                deletion.key_string()
            );
        } else {
            println!("{} {}", tag, deletion.key_string());
        }
        deletion.flow_control_ack();
    }

    fn on_stream_end(&self, stream_end: StreamEnd) {
        tracing::debug!(
            "stream end vb={} reason={:?}",
            stream_end.vbucket,
            stream_end.reason
        );
    }

    fn on_failure(&self, failure: StreamFailure) {
        error!(
            "stream failure (vb {:?}): {}",
            failure.vbucket, failure.error
        );
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "info" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = ClientConfig::new(
        args.seeds.clone(),
        &args.bucket,
        Arc::new(StaticCredentials::new(&args.user, &args.password)),
    );

    let client = match Client::new(config) {
        Ok(client) => client,
        Err(e) => {
            error!("bad configuration: {}", e);
            std::process::exit(1);
        }
    };

    let listener = Arc::new(PrintingListener {
        verbose: args.verbose,
        mutations: AtomicU64::new(0),
        deletions: AtomicU64::new(0),
    });
    client.listener(listener.clone());

    if let Err(e) = client.connect().await {
        error!("connect failed: {}", e);
        std::process::exit(1);
    }

    let from = if args.from_beginning {
        StreamFrom::Beginning
    } else {
        StreamFrom::Now
    };
    let to = if args.up_to_now {
        StreamTo::Now
    } else {
        StreamTo::Infinity
    };

    let result = if args.vbuckets.is_empty() {
        client.stream_all(from, to).await
    } else {
        client.stream_partitions(args.vbuckets.clone(), from, to).await
    };
    if let Err(e) = result {
        error!("stream request failed: {}", e);
        std::process::exit(1);
    }

    if args.up_to_now {
        tokio::select! {
            result = client.wait_until_done() => {
                if let Err(e) = result {
                    error!("streaming aborted: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
            }
        }
    } else if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupted");
    }

    if let Err(e) = client.disconnect().await {
        error!("disconnect failed: {}", e);
    }

    info!(
        "done: {} mutations, {} deletions",
        listener.mutations.load(Ordering::Relaxed),
        listener.deletions.load(Ordering::Relaxed)
    );
}
