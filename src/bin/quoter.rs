//! Quoter — inventory-skewed market maker for binary outcome markets.
//!
//! Wiring order: store → venue registry → inventory FSM → reconciler →
//! quote cycle → scheduler (one full sync, one candidate refresh, then the
//! interval loops) → push listener → control API. Shutdown on
//! SIGTERM/ctrl-c stops the loops, flags the push listener down, and waits
//! for in-flight jobs.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pm_quoter::api::{self, ApiState};
use pm_quoter::config::{EngineConfig, RuntimeSettings};
use pm_quoter::inventory::{InventoryBook, InventoryConfig};
use pm_quoter::push::{PushConfig, PushListener};
use pm_quoter::quoting::cycle::QuoteCycle;
use pm_quoter::reconcile::Reconciler;
use pm_quoter::scheduler::Scheduler;
use pm_quoter::store::Store;
use pm_quoter::venue::kalshi::{CentVenue, HmacSigner};
use pm_quoter::venue::polymarket::ClobVenue;
use pm_quoter::venue::VenueRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let file_appender = tracing_appender::rolling::daily("logs", "quoter.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    info!("═══════════════════════════════════════════════════");
    info!("  pm-quoter — binary outcome market maker");
    info!("═══════════════════════════════════════════════════");

    // Config errors at startup are fatal by design.
    let cfg = match EngineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("startup config error: {e}");
            std::process::exit(1);
        }
    };
    if cfg.dry_run {
        info!("📝 DRY-RUN mode: orders are synthesised locally");
    }

    let store = Store::open(&cfg.db_path)?;

    // Seed runtime settings on first run; after that the store row wins.
    let settings = match store.load_settings()? {
        Some(s) => s,
        None => {
            let s = RuntimeSettings::from_env();
            store.save_settings(&s)?;
            s
        }
    };
    if let Err(e) = settings.validate() {
        error!("startup config error: {e}");
        std::process::exit(1);
    }

    // Venue adapters.
    let mut registry = VenueRegistry::new();
    registry.register(Arc::new(ClobVenue::new(
        cfg.clob_rest_url.clone(),
        cfg.clob_ws_url.clone(),
        cfg.clob_creds.clone(),
        cfg.rpc_timeout_secs,
        cfg.dry_run,
    )?));
    registry.register(Arc::new(CentVenue::new(
        cfg.cent_rest_url.clone(),
        Arc::new(HmacSigner::new(
            cfg.cent_creds.api_key.clone(),
            cfg.cent_creds.api_secret.as_bytes(),
        )),
        cfg.rpc_timeout_secs,
        cfg.dry_run,
    )?));
    info!("🔌 venues registered: {:?}", registry.venue_ids());

    // Single-writer inventory FSM.
    let (inventory, inventory_join) = InventoryBook::spawn(InventoryConfig::default(), store.clone());

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        registry.clone(),
        inventory.clone(),
    ));
    let cycle = Arc::new(QuoteCycle::new(store.clone(), registry.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let degraded = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        registry.clone(),
        cycle,
        reconciler.clone(),
        cfg.instance.clone(),
        shutdown_rx.clone(),
        degraded.clone(),
    ));
    let job_handles = scheduler.start().await;

    // Push listener, if the stream is configured.
    let push_handle = if !cfg.clob_creds.is_empty() || cfg.dry_run {
        let listener = Arc::new(PushListener::new(
            PushConfig::new(
                cfg.clob_ws_url.clone(),
                cfg.clob_creds.api_key.clone(),
                cfg.clob_creds.api_secret.clone(),
                cfg.clob_creds.api_passphrase.clone(),
            ),
            store.clone(),
            inventory.clone(),
            shutdown_rx.clone(),
        ));
        Some(tokio::spawn(listener.run()))
    } else {
        warn!("📡 push listener not started (no credentials)");
        None
    };

    // Control API.
    let api_state = ApiState {
        store: store.clone(),
        reconciler: reconciler.clone(),
        inventory: inventory.clone(),
        degraded: degraded.clone(),
        started_at: chrono::Utc::now(),
    };
    let listener = tokio::net::TcpListener::bind(&cfg.api_bind).await?;
    info!("🌐 control API on {}", cfg.api_bind);
    let api_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::router(api_state)).await {
            error!("control API: {e}");
        }
    });

    // Wait for SIGTERM / ctrl-c.
    wait_for_shutdown().await;
    info!("🛑 shutting down…");
    let _ = shutdown_tx.send(true);

    // Let in-flight jobs drain.
    for h in job_handles {
        let _ = h.await;
    }
    if let Some(h) = push_handle {
        let _ = h.await;
    }
    api_task.abort();
    // The FSM drains whatever is left in its channel when the process ends;
    // its join handle is deliberately not awaited (API/reconciler clones of
    // the handle keep the channel open until drop).
    inventory_join.abort();
    info!("👋 bye");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("SIGTERM hook failed: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
