//! chatsync-user: user-service event worker
//!
//! Consumes identity facts from `auth.events`, projects them into the user
//! store and announces `user.created` on `user.events`.
//!
//! ## Architecture
//! ```text
//! [auth.events] -> [auth-service.auth-events] -> [chatsync-user] -> [user store]
//!                                                      |
//!                                                      v
//!                                                [user.events]
//! ```
//!
//! ## Configuration
//! - CHATSYNC__MESSAGING__URL (or RABBITMQ_URL): broker URL; unset or unsupported disables consumption
//! - CHATSYNC__STORAGE__TYPE / CHATSYNC__STORAGE__PATH: projection store
//! - CHATSYNC_CONFIG or first argument: YAML configuration file
//!
//! Exits non-zero when the subscription ends without a shutdown signal, so
//! the supervisor restarts the worker.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};

use chatsync::bus::{
    resolve_transport, ConnectionManager, EventConsumer, EventPublisher, Role, Topology,
};
use chatsync::config::Config;
use chatsync::services::{ProjectionHandler, UserProjector};
use chatsync::storage::init_storage;
use chatsync::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting chatsync-user event worker");

    let repository = init_storage(&config.storage).await?;

    // One transport shared by both roles, so memory:// runs in a single broker.
    let (url, connector) = resolve_transport(config.messaging.broker_url());

    let consumer_manager = Arc::new(ConnectionManager::new(
        Role::Consumer,
        url.clone(),
        Arc::clone(&connector),
        config.consumer.topology(),
    ));
    let publisher_manager = Arc::new(ConnectionManager::new(
        Role::Publisher,
        url,
        connector,
        Topology::user_publisher(),
    ));

    let projector = UserProjector::new(repository)
        .with_announcer(EventPublisher::new(Arc::clone(&publisher_manager)));
    let handler = ProjectionHandler::new(Arc::new(projector));

    let consumer = EventConsumer::new(
        Arc::clone(&consumer_manager),
        Arc::new(handler),
        config.consumer.settings(),
    );
    consumer.start().await?;

    if !consumer_manager.is_enabled() {
        warn!("No broker configured; waiting for shutdown signal");
    }

    let exit = tokio::select! {
        result = shutdown_signal() => {
            result?;
            info!("Shutdown signal received");
            ExitCode::SUCCESS
        }
        _ = consumer.closed() => {
            error!("Subscription ended unexpectedly, exiting for restart");
            ExitCode::FAILURE
        }
    };

    if let Err(e) = consumer.stop().await {
        error!(error = %e, "Consumer shutdown incomplete");
    }
    if let Err(e) = publisher_manager.close().await {
        warn!(error = %e, "Failed to close publisher channel");
    }

    info!("chatsync-user stopped");
    Ok(exit)
}
