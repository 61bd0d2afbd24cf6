//! End-to-end scenarios across the queue, consumer, adviser and barrier modules.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::adviser::{
    AdviserDecision, ExecutionAdviser, FailureAction, FailureAdviser, FailureStrategy, FallbackAction,
    StepFailure, StepState,
};
use crate::barrier::{BarrierOutcome, BarrierRegistry, BarrierState};
use crate::config::{ConsumerConfig, QueueConfig};
use crate::consumer::{EventConsumer, EventRegistry, InMemoryStreamBroker, MessageHandler, StreamMessage};
use crate::errors::{FlowError, HandlerError};
use crate::events::names;
use crate::queue::{CountFilter, EnqueueOptions, ItemOutcome, QueueWorker, RenewOutcome, WorkQueue};
use crate::testing::{FailingHandler, RecordingHandler, TestQueue};

#[tokio::test]
async fn test_priority_order_is_respected() {
    let fixture = TestQueue::fast();
    for priority in [1.0, 5.0, 3.0] {
        fixture
            .queue
            .enqueue(
                &serde_json::json!({ "priority": priority }),
                EnqueueOptions::new().with_priority(priority),
            )
            .await
            .unwrap();
    }

    let mut claimed = Vec::new();
    for _ in 0..3 {
        claimed.push(fixture.queue.try_claim().await.unwrap().unwrap().priority);
    }
    assert_eq!(claimed, vec![5.0, 3.0, 1.0]);
    assert!(fixture.queue.try_claim().await.unwrap().is_none());

    // Abandoned leases come back in the same order.
    fixture.advance(Duration::from_secs(31));

    let handler = Arc::new(RecordingHandler::new());
    let worker = QueueWorker::new(fixture.queue.clone(), handler.clone());
    worker.pump_all().await.unwrap();

    let seen: Vec<f64> = handler
        .payloads()
        .iter()
        .filter_map(|p| p["priority"].as_f64())
        .collect();
    assert_eq!(seen, vec![5.0, 3.0, 1.0]);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed_and_old_holder_loses_it() {
    let fixture = TestQueue::fast();
    let id = fixture
        .queue
        .enqueue(&serde_json::json!({ "step": "build" }), EnqueueOptions::new())
        .await
        .unwrap();

    let first = fixture.queue.try_claim().await.unwrap().unwrap();
    assert!(fixture.queue.try_claim().await.unwrap().is_none());
    assert!(fixture.queue.find_stuck().await.unwrap().is_empty());

    fixture.advance(Duration::from_secs(31));
    let stuck = fixture.queue.find_stuck().await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, id);

    let second = fixture.queue.try_claim().await.unwrap().unwrap();
    assert_eq!(second.id, id);
    assert_eq!(second.attempts, 2);
    assert_ne!(first.lease_token, second.lease_token);

    let old_token = first.lease_token.unwrap();
    assert_eq!(
        fixture.queue.renew_lease_with_token(&id, old_token).await.unwrap(),
        RenewOutcome::Lost
    );
    let new_token = second.lease_token.unwrap();
    assert!(matches!(
        fixture.queue.renew_lease_with_token(&id, new_token).await.unwrap(),
        RenewOutcome::Renewed(_)
    ));
}

#[tokio::test]
async fn test_delayed_and_requeued_items_respect_visibility() {
    let fixture = TestQueue::fast();
    let id = fixture
        .queue
        .enqueue(
            &serde_json::json!({ "step": "later" }),
            EnqueueOptions::new().with_delay(Duration::from_secs(10)),
        )
        .await
        .unwrap();

    assert!(fixture.queue.try_claim().await.unwrap().is_none());
    fixture.advance(Duration::from_secs(10));
    let item = fixture.queue.try_claim().await.unwrap().unwrap();
    assert_eq!(item.id, id);

    let visible_at = fixture.queue.now() + chrono::Duration::seconds(5);
    fixture.queue.requeue(&id, 1, Some(visible_at)).await.unwrap();
    assert_eq!(fixture.queue.count(CountFilter::Running).await.unwrap(), 0);
    assert!(fixture.queue.try_claim().await.unwrap().is_none());

    fixture.advance(Duration::from_secs(5));
    let again = fixture.queue.try_claim().await.unwrap().unwrap();
    assert_eq!(again.retries_remaining, 1);
    assert_eq!(again.attempts, 2);
}

#[tokio::test]
async fn test_acknowledge_is_idempotent() {
    let fixture = TestQueue::fast();
    let id = fixture
        .queue
        .enqueue(&serde_json::json!({}), EnqueueOptions::new())
        .await
        .unwrap();
    fixture.queue.try_claim().await.unwrap().unwrap();

    fixture.queue.acknowledge(&id).await.unwrap();
    fixture.queue.acknowledge(&id).await.unwrap();
    assert_eq!(fixture.queue.count(CountFilter::All).await.unwrap(), 0);
    assert!(fixture.queue.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_last_retry_failure_is_terminal() {
    let fixture = TestQueue::fast();
    let id = fixture
        .queue
        .enqueue(&serde_json::json!({ "step": "deploy" }), EnqueueOptions::new())
        .await
        .unwrap();
    fixture.queue.try_claim().await.unwrap().unwrap();
    fixture.queue.requeue(&id, 0, None).await.unwrap();

    let handler = Arc::new(FailingHandler::transient("still down"));
    let worker = QueueWorker::new(fixture.queue.clone(), handler.clone()).with_events(fixture.events.clone());
    let outcomes = worker.pump_all().await.unwrap();

    assert_eq!(outcomes, vec![ItemOutcome::Exhausted { attempts: 2 }]);
    assert_eq!(handler.calls(), 1);
    assert_eq!(fixture.queue.count(CountFilter::All).await.unwrap(), 0);

    let record = fixture.events.last_of_type(names::QUEUE_ITEM_EXHAUSTED).unwrap();
    assert_eq!(record["item_id"], id.as_str());
    assert_eq!(record["attempts"], 2);
}

#[tokio::test]
async fn test_concurrent_claims_hand_out_one_lease() {
    let fixture = TestQueue::fast();
    fixture
        .queue
        .enqueue(&serde_json::json!({}), EnqueueOptions::new())
        .await
        .unwrap();

    let mut claims = Vec::new();
    for _ in 0..16 {
        let queue = fixture.queue.clone();
        claims.push(tokio::spawn(async move { queue.try_claim().await }));
    }
    let mut won = 0;
    for claim in claims {
        if claim.await.unwrap().unwrap().is_some() {
            won += 1;
        }
    }
    assert_eq!(won, 1);
}

#[tokio::test]
async fn test_store_outage_surfaces_as_transient() {
    let fixture = TestQueue::fast();
    fixture.store.set_available(false);
    let err = fixture.queue.try_claim().await.unwrap_err();
    assert!(err.is_transient());

    fixture.store.set_available(true);
    assert!(fixture.queue.try_claim().await.unwrap().is_none());
}

#[tokio::test]
async fn test_barrier_abort_fails_late_arrival() {
    let registry = Arc::new(BarrierRegistry::default());
    registry.register("fan-in", 3).unwrap();

    let first = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.arrive("fan-in", "branch-a").await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.status("fan-in").map_or(0, |s| s.arrived_count) < 1 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(registry.try_arrive("fan-in", "branch-b").unwrap(), BarrierState::Waiting);

    registry.abort("fan-in", "branch-b failed");
    assert_eq!(registry.status("fan-in").unwrap().arrived_count, 2);
    let outcome = first.await.unwrap().unwrap();
    assert!(matches!(outcome, BarrierOutcome::Failed { .. }));

    let late = tokio::time::timeout(Duration::from_secs(1), registry.arrive("fan-in", "branch-c"))
        .await
        .unwrap()
        .unwrap();
    let err = late.into_result("fan-in").unwrap_err();
    assert!(matches!(err, FlowError::BarrierAborted { ref reason, .. } if reason == "branch-b failed"));
}

fn precedence_adviser() -> FailureAdviser {
    FailureAdviser::new(vec![
        FailureStrategy::new(
            ["TIMEOUT"],
            FailureAction::Retry {
                retry_count: 2,
                wait_intervals_ms: vec![100, 500],
                on_retry_failure: FallbackAction::Rollback,
            },
        )
        .with_rollback_target("deploy", "provision"),
        FailureStrategy::new(
            ["AUTH"],
            FailureAction::ManualIntervention {
                timeout_ms: None,
                on_timeout: FallbackAction::Abort,
            },
        ),
        FailureStrategy::new(["TIMEOUT", "NETWORK"], FailureAction::Ignore),
    ])
    .unwrap()
}

#[test]
fn test_first_matching_strategy_wins() {
    let adviser = precedence_adviser();
    let categories: BTreeSet<String> = ["NETWORK", "TIMEOUT"].iter().map(ToString::to_string).collect();
    let (index, _) = adviser.select(&categories).unwrap();
    assert_eq!(index, 0);

    let advice = adviser.advise(&StepFailure::new("deploy", ["NETWORK", "TIMEOUT"]));
    assert_eq!(advice.strategy_index, Some(0));
    assert_eq!(advice.decision.next_delay(), Some(Duration::from_millis(100)));

    let network_only = adviser.advise(&StepFailure::new("deploy", ["NETWORK"]));
    assert_eq!(network_only.strategy_index, Some(2));
    assert_eq!(network_only.decision, AdviserDecision::Ignore);
}

#[test]
fn test_retries_escalate_to_rollback() {
    let execution = ExecutionAdviser::new(precedence_adviser());
    execution.start_step("deploy");

    for _ in 0..2 {
        let advice = execution.on_failure("deploy", ["TIMEOUT"]).unwrap();
        assert!(matches!(advice.decision, AdviserDecision::Retry { .. }));
        execution.on_retry_started("deploy").unwrap();
    }
    let advice = execution.on_failure("deploy", ["TIMEOUT"]).unwrap();
    assert_eq!(
        advice.decision,
        AdviserDecision::Rollback {
            target_node_id: "provision".into()
        }
    );
    assert_eq!(execution.state("deploy"), Some(StepState::RolledBack));
}

/// Turns stream events into queue items.
struct EnqueueingHandler {
    queue: Arc<WorkQueue>,
}

#[async_trait]
impl MessageHandler for EnqueueingHandler {
    type Event = serde_json::Value;

    async fn handle(&self, event: Self::Event, _message: &StreamMessage) -> Result<(), HandlerError> {
        self.queue
            .enqueue(&event, EnqueueOptions::new())
            .await
            .map(|_| ())
            .map_err(|e| HandlerError::transient(e.to_string()))
    }
}

#[tokio::test]
async fn test_stream_events_flow_into_queue_workers() {
    let fixture = TestQueue::new(QueueConfig::new("steps", "step_queue"));
    let broker = Arc::new(InMemoryStreamBroker::new());
    let consumer = EventConsumer::new(
        ConsumerConfig::new("pipeline").with_poll_wait(Duration::from_millis(10)),
        broker.clone(),
        EventRegistry::new("eventType").register("step.ready", |v: serde_json::Value| v),
        Arc::new(EnqueueingHandler {
            queue: fixture.queue.clone(),
        }),
    );

    broker
        .publish_json("serviceId", "pipeline", "eventType", "step.ready", &serde_json::json!({ "node": "build" }))
        .unwrap();
    broker
        .publish_json("serviceId", "billing", "eventType", "step.ready", &serde_json::json!({ "node": "invoice" }))
        .unwrap();

    consumer.poll_once().await.unwrap();
    assert_eq!(fixture.queue.count(CountFilter::All).await.unwrap(), 1);
    assert_eq!(consumer.metrics().skipped(), 1);

    let handler = Arc::new(RecordingHandler::new());
    let worker = QueueWorker::new(fixture.queue.clone(), handler.clone());
    assert_eq!(worker.pump_all().await.unwrap(), vec![ItemOutcome::Acked]);
    assert_eq!(handler.payloads(), vec![serde_json::json!({ "node": "build" })]);
}
