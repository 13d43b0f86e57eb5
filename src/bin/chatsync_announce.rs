//! chatsync-announce: publish a registration fact
//!
//! Reads one `auth.user.registered` payload as JSON from stdin and publishes
//! it on `auth.events`, the way the auth service does after a registration
//! commits. Operational smoke tool.
//!
//! ```text
//! echo '{"id":"u1","email":"a@x.com","displayName":"Ann","createdAt":"2024-01-01T00:00:00Z"}' \
//!   | RABBITMQ_URL=amqp://localhost:5672 chatsync-announce [correlation-id]
//! ```

use std::io::Read;
use std::process::ExitCode;

use tracing::{error, info, warn};

use chatsync::bus::PublishOutcome;
use chatsync::config::Config;
use chatsync::events::UserRegistered;
use chatsync::services::AuthEvents;
use chatsync::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let user: UserRegistered = serde_json::from_str(&input)?;
    let correlation_id = std::env::args().nth(1);

    let events = AuthEvents::from_config(&config.messaging);
    let outcome = events
        .user_registered(&user, correlation_id.as_deref())
        .await;

    if let Err(e) = events.close().await {
        warn!(error = %e, "Failed to close publisher channel");
    }

    match outcome {
        PublishOutcome::Published => {
            info!(identity = %user.id, "Registration announced");
            Ok(ExitCode::SUCCESS)
        }
        other => {
            error!(identity = %user.id, outcome = ?other, "Registration not announced");
            Ok(ExitCode::FAILURE)
        }
    }
}
