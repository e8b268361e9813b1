//! End-to-end pipeline tests against the in-memory broker.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use event_router::broker::{BrokerClient, InMemoryBroker};
use event_router::error::{HandlerError, RouterError};
use event_router::message::{metadata_keys, Codec, Envelope, JsonCodec};
use event_router::middleware::{PoisonQueue, Recoverer, Retry};
use event_router::pipeline::build_router;
use event_router::router::{handler_fn, HandlerRegistration, Router, RouterState};
use event_router::types::{Event, PipelineConfig, ProcessedEvent, RouterConfig};

const WAIT: Duration = Duration::from_secs(5);

fn event_envelope(id: i64) -> Envelope {
    Envelope::encode(&JsonCodec, &Event { id }).unwrap()
}

fn processed_ids(broker: &InMemoryBroker, topic: &str) -> Vec<i64> {
    let mut ids: Vec<i64> = broker
        .messages(topic)
        .iter()
        .map(|envelope| JsonCodec.decode::<ProcessedEvent>(&envelope.payload).unwrap().processed_id)
        .collect();
    ids.sort_unstable();
    ids
}

struct Running {
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<Result<(), RouterError>>,
}

impl Running {
    async fn start(router: Router) -> Self {
        let mut state = router.state_watch();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(router.run(shutdown.clone()));
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == RouterState::Running))
            .await
            .expect("router did not start")
            .expect("router state channel closed");
        Self { shutdown, handle }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("router did not stop")
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_single_event_is_processed() {
    let broker = InMemoryBroker::new(2);
    let config = PipelineConfig::default();
    let running = Running::start(build_router(&config, Arc::new(broker.clone())).unwrap()).await;

    let input = event_envelope(5);
    broker.publish("events", input.clone()).await.unwrap();
    assert!(broker.wait_for_messages("events-processed", 1, WAIT).await);
    assert!(broker.wait_for_commits("events", "handler_1", 1, WAIT).await);
    running.stop().await;

    let outputs = broker.messages("events-processed");
    assert_eq!(outputs.len(), 1);
    assert_ne!(outputs[0].id(), input.id());
    assert_eq!(outputs[0].metadata(metadata_keys::CORRELATION_ID), Some(input.id()));

    let processed: ProcessedEvent = JsonCodec.decode(&outputs[0].payload).unwrap();
    assert_eq!(processed.processed_id, 5);
    let age = chrono::Utc::now() - processed.time;
    assert!(age.num_seconds() < 5);
}

#[tokio::test]
async fn test_every_input_yields_one_output() {
    let broker = InMemoryBroker::new(4);
    let config = PipelineConfig::default();
    let running = Running::start(build_router(&config, Arc::new(broker.clone())).unwrap()).await;

    for id in 0..50 {
        broker.publish("events", event_envelope(id)).await.unwrap();
    }
    assert!(broker.wait_for_commits("events", "handler_1", 50, WAIT).await);
    running.stop().await;

    assert_eq!(processed_ids(&broker, "events-processed"), (0..50).collect::<Vec<_>>());
    assert!(broker.messages("events-poison").is_empty());
}

#[tokio::test]
async fn test_undecodable_payload_is_poisoned_once() {
    let broker = InMemoryBroker::new(1);
    let config = PipelineConfig::default();
    assert_eq!(config.poison.max_attempts, 3);
    let running = Running::start(build_router(&config, Arc::new(broker.clone())).unwrap()).await;

    let garbage = Envelope::new("not json");
    broker.publish("events", garbage.clone()).await.unwrap();
    broker.publish("events", event_envelope(1)).await.unwrap();

    assert!(broker.wait_for_commits("events", "handler_1", 2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    running.stop().await;

    let poisoned = broker.messages("events-poison");
    assert_eq!(poisoned.len(), 1);
    assert_eq!(poisoned[0].id(), garbage.id());
    assert_eq!(poisoned[0].payload, garbage.payload);
    assert_eq!(poisoned[0].delivery_attempt(), 3);
    assert_eq!(poisoned[0].metadata(metadata_keys::POISON_SOURCE_TOPIC), Some("events"));
    assert_eq!(poisoned[0].metadata(metadata_keys::POISON_HANDLER), Some("ci-service"));
    assert!(poisoned[0]
        .metadata(metadata_keys::POISON_REASON)
        .is_some_and(|reason| reason.starts_with("failed to decode payload")));

    // The valid event behind it in the same partition still went through.
    assert_eq!(processed_ids(&broker, "events-processed"), vec![1]);
}

#[tokio::test]
async fn test_output_publish_failure_redelivers_input() {
    let broker = InMemoryBroker::new(1);
    broker.fail_next_publishes("events-processed", 1);
    let config = PipelineConfig::default();
    let running = Running::start(build_router(&config, Arc::new(broker.clone())).unwrap()).await;

    broker.publish("events", event_envelope(7)).await.unwrap();
    assert!(broker.wait_for_commits("events", "handler_1", 1, WAIT).await);
    running.stop().await;

    assert_eq!(processed_ids(&broker, "events-processed"), vec![7]);
    assert!(broker.messages("events-poison").is_empty());
}

#[tokio::test]
async fn test_panicking_handler_is_recovered_and_retried() {
    let broker = InMemoryBroker::new(1);
    let mut router = Router::new(RouterConfig::default(), Arc::new(broker.clone()));
    router.add_middleware(Recoverer);
    router
        .add_handler(
            HandlerRegistration::new("fragile", "in", "out"),
            handler_fn(|envelope: Envelope| async move {
                if envelope.delivery_attempt() == 1 {
                    panic!("first delivery always panics");
                }
                Ok(vec![Envelope::new(envelope.payload)])
            }),
        )
        .unwrap();
    let running = Running::start(router).await;

    broker.publish("in", Envelope::new("payload")).await.unwrap();
    assert!(broker.wait_for_commits("in", "fragile", 1, WAIT).await);
    running.stop().await;

    let outputs = broker.messages("out");
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].payload, b"payload".to_vec());
}

#[tokio::test]
async fn test_retry_recovers_within_one_delivery() {
    let broker = InMemoryBroker::new(1);
    let calls = Arc::new(AtomicU32::new(0));
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let mut router = Router::new(RouterConfig::default(), Arc::new(broker.clone()));
    router.add_middleware(Retry::new(3).with_initial_interval(Duration::from_millis(1)));
    let handler = {
        let calls = Arc::clone(&calls);
        let attempts = Arc::clone(&attempts);
        handler_fn(move |envelope: Envelope| {
            let calls = Arc::clone(&calls);
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.lock().unwrap().push(envelope.delivery_attempt());
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(HandlerError::Processing(anyhow::anyhow!("transient")));
                }
                Ok(vec![Envelope::new(envelope.payload)])
            }
        })
    };
    router
        .add_handler(HandlerRegistration::new("flaky", "in", "out"), handler)
        .unwrap();
    let running = Running::start(router).await;

    broker.publish("in", Envelope::new("x")).await.unwrap();
    assert!(broker.wait_for_commits("in", "flaky", 1, WAIT).await);
    running.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(*attempts.lock().unwrap(), vec![1, 1, 1]);
    assert_eq!(broker.messages("out").len(), 1);
}

#[tokio::test]
async fn test_poison_publish_failure_keeps_input() {
    let broker = InMemoryBroker::new(1);
    broker.fail_next_publishes("dead", 1);

    let mut router = Router::new(RouterConfig::default(), Arc::new(broker.clone()));
    router.add_middleware(PoisonQueue::new(Arc::new(broker.clone()), "dead", 1));
    router
        .add_handler(
            HandlerRegistration::consumer_only("rejecting", "in"),
            handler_fn(|_envelope: Envelope| async move {
                Err(HandlerError::Processing(anyhow::anyhow!("rejected")))
            }),
        )
        .unwrap();
    let running = Running::start(router).await;

    broker.publish("in", Envelope::new("x")).await.unwrap();
    assert!(broker.wait_for_messages("dead", 1, WAIT).await);
    assert!(broker.wait_for_commits("in", "rejecting", 1, WAIT).await);
    running.stop().await;

    // First poison publish failed and the input was nacked, the second
    // attempt poisoned it.
    let poisoned = broker.messages("dead");
    assert_eq!(poisoned.len(), 1);
    assert_eq!(poisoned[0].delivery_attempt(), 2);
}

#[tokio::test]
async fn test_cancellation_drains_in_flight_invocation() {
    let broker = InMemoryBroker::new(1);
    let started = Arc::new(Notify::new());

    let mut router = Router::new(RouterConfig::default(), Arc::new(broker.clone()));
    let handler = {
        let started = Arc::clone(&started);
        handler_fn(move |envelope: Envelope| {
            let started = Arc::clone(&started);
            async move {
                started.notify_one();
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(vec![Envelope::new(envelope.payload)])
            }
        })
    };
    router
        .add_handler(HandlerRegistration::new("slow", "in", "out"), handler)
        .unwrap();
    let running = Running::start(router).await;

    broker.publish("in", Envelope::new("in-flight")).await.unwrap();
    tokio::time::timeout(WAIT, started.notified()).await.unwrap();
    running.stop().await;

    assert_eq!(broker.messages("out").len(), 1);
    assert_eq!(broker.committed_offsets("in", "slow"), vec![1]);
}

#[tokio::test]
async fn test_two_routers_share_a_consumer_group() {
    let broker = InMemoryBroker::new(4);
    let config = PipelineConfig::default();
    let first = Running::start(build_router(&config, Arc::new(broker.clone())).unwrap()).await;
    let second = Running::start(build_router(&config, Arc::new(broker.clone())).unwrap()).await;

    for id in 0..100 {
        broker.publish("events", event_envelope(id)).await.unwrap();
    }
    assert!(broker.wait_for_commits("events", "handler_1", 100, WAIT).await);

    first.shutdown.cancel();
    second.shutdown.cancel();
    first.handle.await.unwrap().unwrap();
    second.handle.await.unwrap().unwrap();

    let ids = processed_ids(&broker, "events-processed");
    let unique: HashSet<i64> = ids.iter().copied().collect();
    assert_eq!(unique.len(), ids.len(), "an event was processed twice");
    assert_eq!(ids, (0..100).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_partition_order_is_preserved_through_router() {
    let broker = InMemoryBroker::new(4);
    let mut router = Router::new(RouterConfig::default(), Arc::new(broker.clone()));
    router
        .add_handler(
            HandlerRegistration::new("ordered", "in", "out"),
            handler_fn(|envelope: Envelope| async move {
                let seq: u32 = String::from_utf8_lossy(&envelope.payload).parse().unwrap();
                if seq % 5 == 0 && envelope.delivery_attempt() == 1 {
                    return Err(HandlerError::Processing(anyhow::anyhow!("transient")));
                }
                let key = envelope.partition_key().to_string();
                Ok(vec![Envelope::new(envelope.payload).with_metadata(metadata_keys::PARTITION_KEY, key)])
            }),
        )
        .unwrap();
    let running = Running::start(router).await;

    for seq in 0..30 {
        let envelope = Envelope::new(seq.to_string()).with_metadata(metadata_keys::PARTITION_KEY, "order-7");
        broker.publish("in", envelope).await.unwrap();
    }
    assert!(broker.wait_for_commits("in", "ordered", 30, WAIT).await);
    running.stop().await;

    let outputs: Vec<String> = broker
        .messages("out")
        .iter()
        .map(|envelope| String::from_utf8_lossy(&envelope.payload).into_owned())
        .collect();
    let expected: Vec<String> = (0..30).map(|seq| seq.to_string()).collect();
    assert_eq!(outputs, expected);
}

#[tokio::test]
async fn test_startup_failure_is_fatal() {
    let broker = InMemoryBroker::new(1);
    let config = PipelineConfig::default();
    let router = build_router(&config, Arc::new(broker.clone())).unwrap();
    broker.close().await.unwrap();

    let result = router.run(CancellationToken::new()).await;
    match result {
        Err(RouterError::Startup { handler, .. }) => assert_eq!(handler, "ci-service"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_handler_names_rejected() {
    let broker = InMemoryBroker::new(1);
    let config = PipelineConfig::default();
    let mut router = build_router(&config, Arc::new(broker)).unwrap();

    let result = router.add_handler(
        HandlerRegistration::new("ci-service", "other", "elsewhere"),
        handler_fn(|_envelope: Envelope| async move { Ok(Vec::new()) }),
    );
    assert!(matches!(result, Err(RouterError::DuplicateHandler(_))));
}
