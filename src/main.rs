//! Virtual soundbox daemon: binary entrypoint.
//! Opens the local store, wires the core to the backend, runs the background
//! loops and serves the loopback ingress until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use virtual_soundbox::{
    config,
    metrics::Metrics,
    remote::http::BackendClient,
    store::Store,
    App, Collaborators,
};

/// Compact logs by default; JSON lines with `SOUNDBOX_LOG_FORMAT=json`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("virtual_soundbox=info,warn"));
    let json = std::env::var("SOUNDBOX_LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = config::load_default()?;
    tracing::info!(
        backend = %cfg.backend.base_url,
        db = %cfg.store.path.display(),
        bind = %cfg.server.bind,
        "starting soundboxd"
    );

    let store = Arc::new(
        Store::open(&cfg.store.path)
            .with_context(|| format!("opening store at {}", cfg.store.path.display()))?,
    );
    let client = BackendClient::new(&cfg.backend).context("building backend client")?;
    let bind = cfg.server.bind.clone();

    let app = App::assemble(store, cfg, Collaborators::backend(client))?;
    let swept = app.start(chrono::Utc::now())?;
    tracing::info!(swept, "startup sweep done");

    let background = app.spawn_background();
    let metrics = Metrics::init()?;
    let router = virtual_soundbox::router(app, Some(metrics));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(addr = %bind, "ingress listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("serving ingress")?;

    for h in background {
        h.abort();
    }
    Ok(())
}
