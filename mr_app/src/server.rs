use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mr::config::{
    HostConfig, RetryPolicy, StoreConfig, CONTAINER_VAR, FALLBACK_STORAGE_CONN_VAR,
    STORAGE_CONN_VAR,
};
use mr::coordinator::{self, CoordinatorServer};
use mr::host::Host;
use mr::resolver::InputResolver;
use mr::store::FsObjectStore;
use mr::worker::Worker;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Word-count coordinator: accepts jobs over RPC and runs them.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    #[arg(long, default_value_t = IpAddr::V6(Ipv6Addr::LOCALHOST))]
    bind: IpAddr,

    #[arg(long, default_value_t = 50051)]
    port: u16,

    /// Object store connection string (`file://<root>` or a directory).
    #[arg(long, env = STORAGE_CONN_VAR)]
    storage_conn: Option<String>,

    /// Container read when a job names none.
    #[arg(long, env = CONTAINER_VAR)]
    container: Option<String>,

    /// Directory for checkpoint logs; unfinished runs found here are resumed.
    #[arg(long, env = "MR_CHECKPOINT_DIR")]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 64)]
    max_in_flight: usize,

    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    #[arg(long, default_value_t = 100)]
    initial_backoff_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let storage_conn = args
        .storage_conn
        .or_else(|| std::env::var(FALLBACK_STORAGE_CONN_VAR).ok());
    let store_config = StoreConfig::new(storage_conn, args.container)?;
    let store = FsObjectStore::from_connection_string(&store_config.connection)?;
    info!(
        "object store at {}, default container {}",
        store.root().display(),
        store_config.default_container
    );

    let resolver = InputResolver::new(Arc::new(store), store_config.default_container);
    let host_config = HostConfig {
        retry: RetryPolicy {
            max_attempts: args.max_attempts,
            initial_backoff: Duration::from_millis(args.initial_backoff_ms),
            ..RetryPolicy::default()
        },
        max_in_flight: args.max_in_flight,
        checkpoint_dir: args.checkpoint_dir,
    };
    let host = Host::new(Arc::new(Worker::new(Arc::new(resolver))), host_config)?;

    let server = CoordinatorServer::new(Arc::new(host));
    coordinator::run(server, SocketAddr::new(args.bind, args.port)).await
}
