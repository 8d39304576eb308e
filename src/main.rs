use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rice_variety_service::{AppConfig, ModelRegistry, VarietyCatalog, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(manifest = %config.manifest_path.display(), "loading model artifacts");

    let registry = Arc::new(ModelRegistry::initialize(config.as_ref())?);
    for availability in registry.availability() {
        tracing::info!(
            mode = %availability.mode,
            available = availability.available,
            reason = availability.reason.as_deref().unwrap_or(""),
            "inference mode"
        );
    }

    let catalog = match config.catalog_path.as_deref() {
        Some(path) => VarietyCatalog::from_path(path)?,
        None => VarietyCatalog::default(),
    };
    let router = build_router(config.clone(), registry, Arc::new(catalog));

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
