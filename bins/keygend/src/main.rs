//! keygend: pre-funded key dispenser daemon.
//!
//! Maintains a warm buffer of pre-derived, pre-funded accounts per
//! configured network and hands them out over HTTP, either permanently
//! (`POST /{net}`) or as timed leases (`POST /{net}/ephemeral`) that
//! are recycled when the holder leaves funds behind.
//!
//! ```bash
//! keygend -n networks.yaml -d ./data/keygen -a 0.0.0.0:3000
//! ```

mod http;
mod service;

use std::collections::HashMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use chain_client::ChainClient;
use charger::{Charger, ChargerConfig};
use clap::Parser;
use keypool::{Pool, PoolConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::service::{Network, Service};

/// LMDB map size: plenty for queues of indices.
const DB_MAP_SIZE: usize = 256 * 1024 * 1024;

#[derive(Debug, Parser)]
#[command(name = "keygend", about = "Pre-funded key dispenser")]
struct Args {
    /// Networks configuration file
    #[arg(short = 'n', long = "networks", env = "KEYGEN_NETWORKS")]
    networks: Option<PathBuf>,

    /// Database directory
    #[arg(short = 'd', long = "database", env = "KEYGEN_DB")]
    database: Option<PathBuf>,

    /// Listen address
    #[arg(short = 'a', long = "address", default_value = "0.0.0.0:3000")]
    address: String,

    /// Log level (or a tracing filter directive)
    #[arg(short = 'l', long = "log-level", default_value = "info")]
    log_level: String,

    /// Generate a fresh 64-byte hex seed on stdout and exit
    #[arg(long = "seed")]
    seed: bool,
}

fn fatal(err: impl Display) -> ! {
    eprintln!("keygend: {err}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level)
        .unwrap_or_else(|e| fatal(format_args!("invalid log level {:?}: {e}", args.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.seed {
        let mut seed = [0u8; 64];
        rand_core::RngCore::fill_bytes(&mut rand_core::OsRng, &mut seed);
        println!("{}", hex::encode(seed));
        return;
    }

    // Inline YAML from the environment wins over the networks file.
    let yaml = match std::env::var("KEYGEN_NETWORKS_DATA") {
        Ok(data) if !data.is_empty() => data,
        _ => {
            let path = args
                .networks
                .unwrap_or_else(|| fatal("no networks file configured (-n or KEYGEN_NETWORKS)"));
            std::fs::read_to_string(&path)
                .unwrap_or_else(|e| fatal(format_args!("reading {}: {e}", path.display())))
        }
    };
    let networks_cfg = config::parse(&yaml).unwrap_or_else(|e| fatal(e));

    let db_path = args
        .database
        .unwrap_or_else(|| fatal("no database directory configured (-d or KEYGEN_DB)"));
    std::fs::create_dir_all(&db_path)
        .unwrap_or_else(|e| fatal(format_args!("creating {}: {e}", db_path.display())));
    let env = unsafe {
        heed::EnvOpenOptions::new()
            .map_size(DB_MAP_SIZE)
            .max_dbs((networks_cfg.len() * 3) as u32)
            .open(&db_path)
            .unwrap_or_else(|e| fatal(format_args!("opening {}: {e}", db_path.display())))
    };
    info!(path = %db_path.display(), "database open");

    let http_client = chain_client::make_http_client().unwrap_or_else(|e| fatal(e));

    let mut networks = HashMap::with_capacity(networks_cfg.len());
    for (name, net_cfg) in networks_cfg {
        let net_cfg = Arc::new(net_cfg);
        let client = ChainClient::new(http_client.clone(), &net_cfg.url, &net_cfg.chain_id);
        let charger = Arc::new(Charger::new(
            ChargerConfig {
                seed: net_cfg.seed.clone(),
                master_key: net_cfg.private_key,
                min_balance: net_cfg.min_balance,
                amount: net_cfg.amount,
                ops_per_group: net_cfg.ops_per_group,
            },
            client,
        ));
        let pool = Pool::new(
            &env,
            PoolConfig {
                bucket: name.clone(),
                buffer_length: net_cfg.buffer_length,
                buffer_threshold: net_cfg.buffer_threshold,
                timeout: net_cfg.rpc_timeout,
            },
            Arc::clone(&charger),
        )
        .unwrap_or_else(|e| fatal(format_args!("network {name:?}: {e}")));
        info!(network = %name, "pool ready");
        networks.insert(
            name,
            Network {
                pool,
                charger,
                config: net_cfg,
            },
        );
    }
    let service = Arc::new(Service::new(networks));

    let listener = tokio::net::TcpListener::bind(&args.address)
        .await
        .unwrap_or_else(|e| fatal(format_args!("binding {}: {e}", args.address)));
    info!(address = %args.address, "HTTP server listening");

    let app = http::router(Arc::clone(&service));
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        fatal(e);
    }

    info!("shutting down");
    service.stop().await;
    info!("bye");
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .unwrap_or_else(|e| fatal(format_args!("installing SIGTERM handler: {e}")))
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
