//! AMQP/RabbitMQ integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --ignored --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required, but Docker must be available.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;
use futures::StreamExt;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

use chatsync::bus::{
    AmqpConnector, BusError, ConnectionManager, ConsumerSettings, Connector, DeadLetter,
    EventConsumer, EventHandler, EventPublisher, FatalHandler, HandlerError, PublishOutcome, Role,
    Topology,
};
use chatsync::events::{InboundEvent, UserRegistered, AUTH_USER_REGISTERED};
use chatsync::services::{AuthEvents, ProjectionHandler, UserProjector};
use chatsync::storage::MemoryUserRepository;

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

/// Records transport failures instead of exiting the test process.
struct LogOnly;

impl FatalHandler for LogOnly {
    fn transport_failed(&self, role: Role, error: &BusError) {
        println!("transport failure on {}: {}", role, error);
    }
}

fn manager(url: &str, role: Role, topology: Topology) -> Arc<ConnectionManager> {
    Arc::new(
        ConnectionManager::new(
            role,
            Some(url.to_string()),
            Arc::new(AmqpConnector::new()),
            topology,
        )
        .with_fatal_handler(Arc::new(LogOnly)),
    )
}

/// Unique queue per test so runs never share state.
fn auth_consumer_topology() -> Topology {
    Topology::auth_consumer(format!("auth-events-test-{}", uuid::Uuid::new_v4().simple()))
}

fn registration(id: &str) -> UserRegistered {
    UserRegistered {
        id: id.to_string(),
        email: format!("{}@example.com", id),
        display_name: "Ann".to_string(),
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

/// Handler that counts calls and always fails permanently.
struct RejectingHandler {
    calls: Arc<AtomicUsize>,
}

impl EventHandler for RejectingHandler {
    fn handle(&self, _event: Arc<InboundEvent>) -> BoxFuture<'static, Result<(), HandlerError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(HandlerError::Permanent("rejected".to_string())) })
    }
}

/// Handler that counts calls and succeeds.
struct CountingHandler {
    calls: Arc<AtomicUsize>,
}

impl EventHandler for CountingHandler {
    fn handle(&self, _event: Arc<InboundEvent>) -> BoxFuture<'static, Result<(), HandlerError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
#[ignore = "requires Docker for RabbitMQ container"]
async fn test_registration_projected_over_rabbitmq() {
    println!("=== AMQP Registration Projection ===");

    let (_container, url) = start_rabbitmq().await;

    let repo = Arc::new(MemoryUserRepository::new());
    let projector = Arc::new(UserProjector::new(repo.clone()));
    let consumer = EventConsumer::new(
        manager(&url, Role::Consumer, auth_consumer_topology()),
        Arc::new(ProjectionHandler::new(projector.clone())),
        ConsumerSettings::default(),
    );
    consumer.start().await.expect("consumer should subscribe");

    let auth = AuthEvents::new(EventPublisher::new(manager(
        &url,
        Role::Publisher,
        Topology::auth_publisher(),
    )));
    let outcome = auth.user_registered(&registration("u1"), Some("req-1")).await;
    assert_eq!(outcome, PublishOutcome::Published);

    let mut found = None;
    for _ in 0..100 {
        found = projector.get_by_id("u1").await.unwrap();
        if found.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let record = found.expect("user should be projected");
    assert_eq!(record.email, "u1@example.com");

    consumer.stop().await.expect("consumer should stop cleanly");
    auth.close().await.unwrap();

    println!("=== AMQP Registration Projection PASSED ===");
}

#[tokio::test]
#[ignore = "requires Docker for RabbitMQ container"]
async fn test_published_message_is_persistent_json() {
    println!("=== AMQP Message Properties ===");

    let (_container, url) = start_rabbitmq().await;

    let topology = auth_consumer_topology();
    let queue = topology.queue().unwrap().to_string();
    let channel = AmqpConnector::new()
        .connect(&url, Arc::new(|_: BusError| {}))
        .await
        .expect("connect");
    topology.declare(channel.as_ref()).await.expect("declare");
    let mut subscription = channel.consume(&queue, "properties-test").await.unwrap();

    let publisher = EventPublisher::new(manager(&url, Role::Publisher, Topology::auth_publisher()));
    let outcome = publisher.publish(AUTH_USER_REGISTERED, registration("u1")).await;
    assert_eq!(outcome, PublishOutcome::Published);

    let delivery = tokio::time::timeout(Duration::from_secs(10), subscription.deliveries.next())
        .await
        .expect("delivery timeout")
        .expect("stream ended")
        .expect("delivery error");

    assert_eq!(delivery.routing_key, AUTH_USER_REGISTERED);
    assert!(delivery.properties.persistent);
    assert_eq!(
        delivery.properties.content_type.as_deref(),
        Some("application/json")
    );
    assert_eq!(delivery.properties.kind.as_deref(), Some(AUTH_USER_REGISTERED));
    assert!(delivery.properties.message_id.is_some());
    let event = InboundEvent::decode(&delivery.data).unwrap();
    assert_eq!(event.payload_str("id"), Some("u1"));

    delivery.ack().await.unwrap();
    channel.cancel("properties-test").await.unwrap();
    channel.close().await.unwrap();
    publisher.close().await.unwrap();

    println!("=== AMQP Message Properties PASSED ===");
}

#[tokio::test]
#[ignore = "requires Docker for RabbitMQ container"]
async fn test_rejected_message_is_not_redelivered() {
    println!("=== AMQP Reject Without Requeue ===");

    let (_container, url) = start_rabbitmq().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let consumer = EventConsumer::new(
        manager(&url, Role::Consumer, auth_consumer_topology()),
        Arc::new(RejectingHandler {
            calls: calls.clone(),
        }),
        ConsumerSettings::default(),
    );
    consumer.start().await.unwrap();

    let auth = AuthEvents::new(EventPublisher::new(manager(
        &url,
        Role::Publisher,
        Topology::auth_publisher(),
    )));
    auth.user_registered(&registration("u1"), None).await;

    eventually("first delivery", || calls.load(Ordering::SeqCst) >= 1).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "nack must not requeue");

    consumer.stop().await.unwrap();
    auth.close().await.unwrap();

    println!("=== AMQP Reject Without Requeue PASSED ===");
}

#[tokio::test]
#[ignore = "requires Docker for RabbitMQ container"]
async fn test_rejected_message_is_dead_lettered() {
    println!("=== AMQP Dead Letter ===");

    let (_container, url) = start_rabbitmq().await;

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let dead_letter = DeadLetter {
        exchange: format!("auth.events.dlx.{}", suffix),
        queue: format!("auth-events-dlq-{}", suffix),
    };
    let rejecting = EventConsumer::new(
        manager(
            &url,
            Role::Consumer,
            auth_consumer_topology().with_dead_letter(Some(dead_letter.clone())),
        ),
        Arc::new(RejectingHandler {
            calls: Arc::new(AtomicUsize::new(0)),
        }),
        ConsumerSettings::default(),
    );
    rejecting.start().await.unwrap();

    let dead = Arc::new(AtomicUsize::new(0));
    let dlq_reader = EventConsumer::new(
        manager(
            &url,
            Role::Consumer,
            Topology::consumer(&dead_letter.exchange, &dead_letter.queue, ["#"]),
        ),
        Arc::new(CountingHandler {
            calls: dead.clone(),
        }),
        ConsumerSettings::default(),
    );
    dlq_reader.start().await.unwrap();

    let auth = AuthEvents::new(EventPublisher::new(manager(
        &url,
        Role::Publisher,
        Topology::auth_publisher(),
    )));
    auth.user_registered(&registration("u1"), None).await;

    eventually("dead-lettered delivery", || dead.load(Ordering::SeqCst) == 1).await;

    rejecting.stop().await.unwrap();
    dlq_reader.stop().await.unwrap();
    auth.close().await.unwrap();

    println!("=== AMQP Dead Letter PASSED ===");
}
