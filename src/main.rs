use std::net::SocketAddr;

use backoffice::auth;
use backoffice::config::AppConfig;
use backoffice::db::{init_pool, run_migrations};
use backoffice::error::AppError;
use backoffice::routes::create_router;
use backoffice::services::sessions::spawn_expiry_sweeper;
use backoffice::state::AppState;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_logging();

    let config = AppConfig::from_env()?;
    let db = init_pool(&config.database_url).await?;

    if let Err(err) = run_migrations(&db).await {
        error!("migration failed: {err:?}");
        return Err(err);
    }

    let state = AppState::new(config.clone(), db);

    // The first tick fires immediately, which covers the startup purge.
    spawn_expiry_sweeper(state.sessions.clone(), config.session.sweep_interval());

    if let Some(admin) = &config.bootstrap_admin {
        auth::ensure_admin(&state, admin).await?;
    }

    info!(
        timeout_secs = config.session.inactivity_timeout_secs,
        exempt = config.session.login_exempt_urls.len(),
        backend = ?config.session.backend,
        "session chain configured"
    );

    let app = create_router(state);

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,backoffice=debug,tower_http=info".into());

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
