//! User-side projection of identity facts.
//!
//! Each `auth.user.registered` fact becomes a local [`UserRecord`]. Writes
//! are last-write-wins by the fact's `occurredAt`: re-applying a fact leaves
//! the record unchanged and a fact older than the stored one is ignored, so
//! duplicates and reordering converge on the newest fact.
//!
//! After a projection that writes, the service announces `user.created` on
//! `user.events`, best-effort. Stale and unchanged facts announce nothing.

use std::sync::Arc;

use chrono::SubsecRound;
use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::bus::{EventHandler, EventPublisher, HandlerError};
use crate::events::{
    CodecError, DomainEvent, EventMetadata, InboundEvent, UserCreated,
    UserRegistered, AUTH_USER_REGISTERED, USER_CREATED,
};
use crate::storage::{Applied, StorageError, UserRecord, UserRepository};

/// Errors applying a fact.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] CodecError),

    #[error("Unsupported event type: {0}")]
    UnsupportedType(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<ProjectionError> for HandlerError {
    fn from(e: ProjectionError) -> Self {
        match e {
            ProjectionError::Storage(StorageError::Corrupt { .. })
            | ProjectionError::InvalidPayload(_)
            | ProjectionError::UnsupportedType(_) => HandlerError::Permanent(e.to_string()),
            ProjectionError::Storage(_) => HandlerError::Transient(e.to_string()),
        }
    }
}

/// Applies identity facts to the user repository.
pub struct UserProjector {
    repository: Arc<dyn UserRepository>,
    announcer: Option<EventPublisher>,
}

impl UserProjector {
    pub fn new(repository: Arc<dyn UserRepository>) -> Self {
        Self {
            repository,
            announcer: None,
        }
    }

    /// Announce `user.created` through `publisher` after each projection.
    pub fn with_announcer(mut self, publisher: EventPublisher) -> Self {
        self.announcer = Some(publisher);
        self
    }

    /// Apply one registration fact.
    pub async fn apply(
        &self,
        event: &DomainEvent<UserRegistered>,
    ) -> Result<Applied, ProjectionError> {
        let user = &event.payload;
        let record = UserRecord {
            id: user.id.clone(),
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            created_at: user.created_at.trunc_subsecs(3),
            updated_at: event.occurred_at.trunc_subsecs(3),
            source_version: event.occurred_at.timestamp_millis(),
        };

        let applied = self.repository.upsert_if_newer(&record).await?;

        match applied {
            Applied::Stale => {
                info!(
                    identity = %record.id,
                    occurred_at = %event.occurred_at,
                    "Ignoring fact older than stored record"
                );
            }
            Applied::Unchanged => {
                debug!(identity = %record.id, "Fact already applied");
            }
            Applied::Created | Applied::Updated => {
                info!(identity = %record.id, applied = ?applied, "Projected user");
                self.announce(event).await;
            }
        }

        Ok(applied)
    }

    /// Decode and apply a fact as it arrived off the wire.
    pub async fn apply_inbound(&self, event: &InboundEvent) -> Result<Applied, ProjectionError> {
        if event.event_type != AUTH_USER_REGISTERED {
            return Err(ProjectionError::UnsupportedType(event.event_type.clone()));
        }
        let typed = event.clone().into_typed::<UserRegistered>()?;
        self.apply(&typed).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<UserRecord>, ProjectionError> {
        Ok(self.repository.get_by_id(id).await?)
    }

    /// Projected users, newest first.
    pub async fn list(&self) -> Result<Vec<UserRecord>, ProjectionError> {
        Ok(self.repository.list().await?)
    }

    async fn announce(&self, cause: &DomainEvent<UserRegistered>) {
        let Some(publisher) = &self.announcer else {
            return;
        };

        let user = &cause.payload;
        let payload = UserCreated {
            id: user.id.clone(),
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            created_at: user.created_at,
        };
        let mut metadata = EventMetadata::versioned();
        if let Some(correlation_id) = cause.correlation_id() {
            metadata = metadata.with_correlation_id(correlation_id);
        }

        let outcome = publisher
            .publish_with_metadata(USER_CREATED, &payload, metadata)
            .await;
        debug!(identity = %user.id, outcome = ?outcome, "user.created announcement");
    }
}

/// Bus handler feeding deliveries into a [`UserProjector`].
#[derive(Clone)]
pub struct ProjectionHandler {
    projector: Arc<UserProjector>,
}

impl ProjectionHandler {
    pub fn new(projector: Arc<UserProjector>) -> Self {
        Self { projector }
    }
}

impl EventHandler for ProjectionHandler {
    fn handle(&self, event: Arc<InboundEvent>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let projector = Arc::clone(&self.projector);
        Box::pin(async move {
            projector
                .apply_inbound(&event)
                .await
                .map(|_| ())
                .map_err(HandlerError::from)
        })
    }
}
