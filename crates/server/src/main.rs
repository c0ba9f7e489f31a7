use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tracing::info;
use volant_server::alert::LogAlerter;
use volant_server::auth::{Authenticator, TokenDirectory};
use volant_server::config::{self, ServerConfig};
use volant_server::metrics::Metrics;
use volant_server::relay::{EventSink, OutboxRelay};
use volant_server::router::ChannelRouter;
use volant_server::session::{self, ServerState};
use volant_server::signal::SignalGateway;
use volant_storage::{EventLog, OutboxStore, RecipientDirectory};

fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();

    let config_path = env::var("VOLANT_CONFIG").unwrap_or_else(|_| "volant.toml".to_string());
    let config = config::load_configuration(Path::new(&config_path)).expect("configuration");

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(run(config)).expect("server");
}

async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let storage = Arc::new(volant_storage::connect(&config.postgres_dsn).await?);
    storage.migrate().await?;

    let metrics = Arc::new(Metrics::new());
    let router = Arc::new(ChannelRouter::new(metrics.clone()));
    let signals = Arc::new(SignalGateway::new(
        router.clone(),
        metrics.clone(),
        config.call_route_ttl,
    ));
    let authenticator: Arc<dyn Authenticator> =
        Arc::new(TokenDirectory::new(config.static_tokens.clone()));

    let relay = Arc::new(OutboxRelay::new(
        storage.clone() as Arc<dyn OutboxStore>,
        storage.clone() as Arc<dyn RecipientDirectory>,
        router.clone() as Arc<dyn EventSink>,
        Arc::new(LogAlerter),
        metrics.clone(),
        config.relay.clone(),
    ));
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let relay_task = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.run(shutdown_rx).await })
    };

    let sweeper = {
        let signals = signals.clone();
        let every = config.call_route_ttl;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                let removed = signals.sweep_expired();
                if removed > 0 {
                    info!(removed, "stale call routes dropped");
                }
            }
        })
    };

    let listener = TcpListener::bind(&config.bind).await?;
    info!(address = %config.bind, "volant listening");
    let state = Arc::new(ServerState {
        config,
        metrics,
        router,
        signals,
        authenticator,
        event_log: storage.clone() as Arc<dyn EventLog>,
    });

    tokio::select! {
        _ = session::serve(listener, state) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    let _ = shutdown_tx.send(()).await;
    let _ = relay_task.await;
    sweeper.abort();
    Ok(())
}
