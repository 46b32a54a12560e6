//! Runs one map against an in-memory backend and reports what reached it.

use std::io::IsTerminal;
use std::sync::Arc;

use clap::Parser;
use harbor_core::Value;
use harbor_server::storage::datastores::InMemoryMapStore;
use harbor_server::{InitialLoadMode, MapService, MapStore, MapStoreConfig, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "harbor-demo")]
struct Args {
    /// Entries pre-seeded into the backend.
    #[arg(long, env = "HARBOR_DEMO_KEYS", default_value_t = 1_000)]
    keys: usize,

    /// 0 writes through; a positive value enables write-behind.
    #[arg(long, env = "HARBOR_WRITE_DELAY_SECONDS", default_value_t = 1)]
    write_delay_seconds: i64,

    #[arg(long, env = "HARBOR_LOAD_CHUNK_SIZE", default_value_t = 100)]
    chunk_size: usize,

    #[arg(long, env = "HARBOR_PARTITION_COUNT", default_value_t = 16)]
    partitions: u32,

    /// Block every operation until the initial load finished.
    #[arg(long)]
    eager: bool,

    #[arg(long, env = "HARBOR_JSON_LOGS")]
    json_logs: bool,

    /// Keep running until Ctrl-C so the flush worker drains on its own.
    #[arg(long)]
    wait: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,harbor_server=debug".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        tracing_subscriber::fmt()
            .with_ansi(ansi)
            .with_env_filter(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let backend = Arc::new(InMemoryMapStore::new().with_lifecycle());
    backend.seed((0..args.keys).map(|i| (format!("key-{i}"), Value::from(format!("value-{i}").as_str()))));

    let service = Arc::new(MapService::new(ServerConfig {
        node_id: "demo-node".to_string(),
        partition_count: args.partitions,
        ..ServerConfig::default()
    }));
    let dyn_store: Arc<dyn MapStore> = Arc::clone(&backend) as _;
    let mode = if args.eager {
        InitialLoadMode::Eager
    } else {
        InitialLoadMode::Lazy
    };
    service.configure_map(
        "demo",
        MapStoreConfig::with_store(dyn_store)
            .write_delay_seconds(args.write_delay_seconds)
            .load_chunk_size(args.chunk_size)
            .initial_load_mode(mode),
    )?;
    service.start().await;

    let map = service.get_map("demo").await?;
    tracing::info!(size = map.size().await?, "initial load finished");

    for i in 0..10 {
        map.put(&format!("key-{i}"), Value::Int(i)).await?;
    }
    map.remove("key-10").await?;
    tracing::info!(dirty = map.dirty_entry_count(), "mutations applied");

    if args.wait {
        tracing::info!("waiting for Ctrl-C");
        tokio::signal::ctrl_c().await?;
    } else {
        let flushed = map.flush().await?;
        tracing::info!(flushed, "flushed");
    }

    if let Some(stats) = map.stats() {
        tracing::info!(?stats, "map statistics");
    }
    service.shutdown().await?;

    let calls = backend.calls();
    tracing::info!(
        load_all_keys = calls.load_all_keys,
        load_all = calls.load_all,
        store = calls.store,
        store_all = calls.store_all,
        delete = calls.delete,
        delete_all = calls.delete_all,
        backend_entries = backend.len(),
        "backend calls"
    );
    Ok(())
}
