mod acl;
mod adapter;
mod config;
mod error;
mod handlers;
mod peer_client;
mod recovery;
mod router;
mod state;
mod store;
mod supervisor;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::acl::SiblingAcl;
use crate::adapter::{HttpSettlementClient, SettlementClient};
use crate::config::NodeConfig;
use crate::handlers::HandlerRegistry;
use crate::peer_client::PeerClient;
use crate::state::AppState;
use crate::store::StreamStore;
use crate::supervisor::SupervisorPool;

/// One node of the observer tree. Every node — root or leaf — runs this
/// same binary; behavior (root vs. interior) follows purely from whether
/// `parent` is set in the node's own config file.
#[derive(Parser, Debug)]
#[command(name = "observer-node")]
struct Cli {
    /// Path to this node's TOML config (topology, handler overrides).
    #[arg(long, default_value = "node.toml")]
    config: PathBuf,
    /// Where to persist the stream table between restarts. Omit to run
    /// with an in-memory-only store (recovery has nothing to recover).
    #[arg(long)]
    store: Option<PathBuf>,
}

#[tokio::main]
/// Loads configuration, reattaches any in-flight streams left over from
/// a previous run, then serves the delegation protocol on `bind_addr`.
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let cli = Cli::parse();

    let config: NodeConfig = config::load(&cli.config).await.unwrap_or_else(|err| {
        tracing::error!(?err, path = ?cli.config, "failed to load node config");
        panic!("failed to load node config from {:?}: {err}", cli.config);
    });

    let acl = Arc::new(SiblingAcl::resolve(&config.sibling_hosts()).await);
    let store = StreamStore::load(cli.store)
        .await
        .unwrap_or_else(|err| panic!("failed to load stream store: {err}"));
    let handlers = HandlerRegistry::from_config(&config);
    let settlement: Box<dyn SettlementClient> = match &config.settlement_webhook {
        Some(url) => Box::new(HttpSettlementClient::new(url.clone())),
        None => {
            tracing::warn!("no settlement_webhook configured; PATCH at the root will fail to settle");
            Box::new(HttpSettlementClient::new(String::new()))
        }
    };

    let bind_addr: SocketAddr = config
        .bind_addr
        .parse()
        .unwrap_or_else(|err| panic!("invalid bind_addr {:?}: {err}", config.bind_addr));

    let app_state = Arc::new(AppState {
        config,
        store,
        pool: SupervisorPool::default(),
        handlers,
        acl: acl.clone(),
        peers: PeerClient::default(),
        settlement,
    });

    recovery::recover(&app_state).await;

    let app = Router::new()
        .route("/streams", get(router::list_streams))
        .route(
            "/streams/{handle}/{gametype}",
            get(router::get_stream)
                .put(router::put_stream)
                .patch(router::patch_stream)
                .delete(router::delete_stream),
        )
        .route("/load", get(router::load))
        .route_layer(axum::middleware::from_fn_with_state(acl, acl::restrict_siblings))
        .with_state(app_state);

    tracing::info!(%bind_addr, "observer node listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await.unwrap();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .unwrap();
}
