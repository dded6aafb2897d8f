use actix_web::{web, App, HttpServer};
use dex_trading_core::api;
use dex_trading_core::balance::InMemoryBalanceStore;
use dex_trading_core::bus::{MemoryBus, MessageBus, NatsBus};
use dex_trading_core::chain::simulated::TEST_OPERATOR_KEY;
use dex_trading_core::chain::{ChainClient, EthersChainClient, SimulatedChain};
use dex_trading_core::config::{ChainBackend, Settings};
use dex_trading_core::context::CoreContext;
use dex_trading_core::persistence::{InMemoryStore, RecordStore, RedbStore};
use dex_trading_core::pipeline::Pipeline;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║                    DEX TRADING CORE                           ║");
    info!("║        Matching · Routing · Lifecycle · Settlement            ║");
    info!("╚═══════════════════════════════════════════════════════════════╝");

    let mut settings = Settings::new().map_err(|e| {
        error!("❌ Failed to load configuration: {}", e);
        e
    })?;

    let bus: Arc<dyn MessageBus> = match &settings.bus.nats_url {
        Some(_) => Arc::new(NatsBus::connect(&settings.bus).await?),
        None => {
            warn!("⚠️ No NATS URL configured, using the in-process bus");
            Arc::new(MemoryBus::new())
        }
    };

    let backend = settings.chain.backend().map_err(|e| {
        error!("❌ {}", e);
        e
    })?;
    let chain: Arc<dyn ChainClient> = match backend {
        ChainBackend::Rpc(url) => Arc::new(EthersChainClient::connect(&url).await?),
        ChainBackend::Simulated => {
            warn!("⚠️ chain.simulated is set, settling against the simulated chain");
            if settings.chain.operator_private_key.is_none() {
                settings.chain.operator_private_key = Some(TEST_OPERATOR_KEY.to_string());
            }
            Arc::new(SimulatedChain::new())
        }
    };

    let store: Arc<dyn RecordStore> = match &settings.store.redb_path {
        Some(path) => {
            info!("Opening record store at {}", path);
            Arc::new(RedbStore::new(path)?)
        }
        None => Arc::new(InMemoryStore::new()),
    };

    let ctx = CoreContext::new_system(bus, Arc::new(InMemoryBalanceStore::new()), chain, store);
    let halts = ctx.halts.clone();
    let pipeline = Pipeline::start(ctx, &settings).await?;
    info!("✅ Core components initialized");

    let bind_address = format!("0.0.0.0:{}", settings.api.port);
    info!("🚀 Starting API Server on {}", bind_address);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(halts.clone()))
            .configure(api::config)
    })
    .bind(&bind_address)?
    .disable_signals()
    .run();
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    server_handle.stop(true).await;
    pipeline.shutdown().await;
    if let Err(e) = server_task.await {
        error!("API server task failed: {}", e);
    }
    Ok(())
}
