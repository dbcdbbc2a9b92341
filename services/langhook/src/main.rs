use std::env;
use std::net::SocketAddr;

use langhook::config::Settings;
use langhook::state::AppState;
use langhook::{bootstrap, bus, db, map, streams};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "langhook starting");

    let settings = Settings::from_env();
    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    info!("connecting to database...");
    let pool = db::create_pool(&database_url)
        .await
        .expect("failed to connect to Postgres");
    bootstrap::run(&pool).await.expect("schema bootstrap failed");

    let event_bus = bus::EventBus::new();
    streams::create_streams(&event_bus, &settings.raw_subject);

    let bind_addr = settings.bind_addr.clone();
    let (state, retire_rx) = AppState::new(pool, event_bus, settings);
    let shutdown = CancellationToken::new();

    // Consumers come up before the HTTP listener so a subscription created
    // by the first request already has a stream to bind to.
    if let Err(e) = state.supervisor.reload().await {
        error!(error = %e, "initial supervisor reload failed");
    }
    let supervisor_task = state
        .supervisor
        .clone()
        .start_background(retire_rx, shutdown.clone());

    let raw_consumer = tokio::spawn({
        let bus = state.bus.clone();
        let consumer_settings = state.settings.consumer.clone();
        let raw_subject = state.settings.raw_subject.clone();
        let service = state.map_service();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) =
                map::consumer::run(bus, consumer_settings, raw_subject, service, shutdown.clone())
                    .await
            {
                error!(error = %e, "raw consumer failed");
                shutdown.cancel();
            }
        }
    });

    let supervisor = state.supervisor.clone();
    let event_bus = state.bus.clone();
    let router = langhook::build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "server listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await
    .expect("server error");

    // Stop pulls, give in-flight handlers their grace period, then close
    // the stream connection.
    shutdown.cancel();
    supervisor.shutdown_all().await;
    event_bus.begin_shutdown();
    let _ = raw_consumer.await;
    let _ = supervisor_task.await;
    info!("langhook shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown. Also returns if an internal fatal error cancelled the token.
async fn shutdown_signal(shutdown: CancellationToken) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
        () = shutdown.cancelled() => { info!("internal shutdown requested"); },
    }
}
