//! Sporket Bus Host
//!
//! Binds the bus server from environment configuration and logs surfaced
//! events. The shared secret comes from `SPORKET_PASSWORD`; bind address and
//! path from `SPORKET_HOST`, `SPORKET_PORT`, `SPORKET_PATH`.

use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use sporket::{Server, ServerConfig, ServerEvent, VERSION};

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("Sporket bus v{}", VERSION);
    if sporket::shared_secret().is_err() {
        error!("SPORKET_PASSWORD is not set; no client will authenticate");
    }

    let config = ServerConfig::from_env();
    let server = Server::new(config);
    let mut events = server.subscribe();

    if let Err(error) = server.listen().await {
        error!("Server error: {}", error);
        return;
    }

    loop {
        match events.recv().await {
            Ok(ServerEvent::ClientConnect { uuid }) => info!(%uuid, "client authenticated"),
            Ok(ServerEvent::ClientDisconnect { uuid }) => info!(%uuid, "client disconnected"),
            Ok(ServerEvent::Message { uuid, payload }) => {
                info!(%uuid, ?payload, "message");
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                info!(skipped, "event stream lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
