use std::time::Duration;

use tracing_subscriber::EnvFilter;

use meridian::api::server;
use meridian::api::types::ApiContext;
use meridian::config::{self, AppConfig};
use meridian::session::spawn_sweeper;

/// Session sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    // Missing secrets are fatal: the service refuses to serve any
    // medical endpoint without them.
    let app_config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error; refusing to start");
            std::process::exit(1);
        }
    };

    let ctx = match ApiContext::build(app_config) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(error = %e, "failed to wire components");
            std::process::exit(1);
        }
    };

    // Clean image artifacts left behind by a previous run, then bring
    // the tool pool up. Individual connect failures are tolerated.
    ctx.images.startup_sweep();
    ctx.pool.connect_all().await;

    let sweeper = spawn_sweeper(ctx.sessions.clone(), SWEEP_INTERVAL);
    spawn_maintenance(ctx.clone());

    let listener = match server::bind(&ctx).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    if let Err(e) = server::run(ctx, listener, server::shutdown_signal()).await {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }

    sweeper.abort();
    tracing::info!("{} stopped", config::APP_NAME);
}

/// Periodic housekeeping: a backstop for image TTLs whose in-process
/// timers were lost, plus shedding idle rate-limit windows so the key
/// map stays bounded over the service's lifetime.
fn spawn_maintenance(ctx: ApiContext) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            ctx.images.sweep_expired();
            ctx.rate_limiter.prune(chrono::Utc::now().timestamp_millis());
        }
    });
}
