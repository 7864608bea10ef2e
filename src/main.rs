mod cli;
mod env;
mod error;
mod gateway;
mod logger;
mod protocol;
mod registry;
mod runtime;
mod session;
mod sftp;
mod ssh;
mod stats;
mod store;
mod vault;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};

use crate::ssh::hostkeys::KnownHosts;
use crate::ssh::DialerConfig;
use crate::store::PostgresStore;
use crate::vault::Vault;

fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("install rustls crypto provider");

    let rt = runtime::build_from_env();

    rt.block_on(async {
        let cli = cli::parse();
        match cli.command {
            Some(cli::Commands::Version) => {
                println!("{}", env::version());
                Ok(())
            }
            Some(cli::Commands::Start) | None => {
                logger::init("sessiongate");
                let config = env::init()?;
                start(config).await
            }
        }
    })
}

/// Assembles the gateway's shared dependencies (Vault, Dialer, Store) from
/// config and hands off to `gateway::start` for the axum/WebSocket side.
async fn start(config: env::Env) -> anyhow::Result<()> {
    let vault = Vault::from_deployment_secret(&config.deployment_secret);

    let known_hosts = KnownHosts::load(&config.known_hosts_path)?;
    let dialer_cfg = DialerConfig {
        connect_timeout: Duration::from_secs(10),
        keepalive_interval: Duration::from_secs(10),
        keepalive_max: 3,
        host_key_policy: config.host_key_policy,
        known_hosts: Arc::new(Mutex::new(known_hosts)),
    };

    let store = if config.database_url.is_empty() {
        info!("DATABASE_URL not set, credential store and session log disabled");
        None
    } else {
        match PostgresStore::connect(&config.database_url, 10).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!("failed to connect to postgres, continuing without a credential store: {e}");
                None
            }
        }
    };

    gateway::start(config, vault, dialer_cfg, store).await
}
