use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use accord_bus::{
    detached, handler_fn, topics, BreakerState, EventBus, HandlerError, HandlerOptions, Priority,
    PublishOptions,
};
use accord_core::config::BusConfig;
use serde_json::{json, Value};

fn config() -> BusConfig {
    BusConfig {
        backoff_base_ms: 10,
        backoff_max_ms: 100,
        ..BusConfig::default()
    }
}

/// Handler that records the `data` of every event it sees.
fn recorder(bus: &EventBus, event_type: &str) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.register(
        event_type,
        handler_fn(move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event.data);
                Ok(())
            }
        }),
        HandlerOptions::new(),
    )
    .expect("register");
    seen
}

fn always_failing(bus: &EventBus, event_type: &str, calls: Arc<AtomicUsize>) {
    bus.register(
        event_type,
        handler_fn(move |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::failed("store unavailable"))
            }
        }),
        HandlerOptions::new().retries(0),
    )
    .expect("register");
}

#[tokio::test]
async fn increasing_priorities_drain_in_decreasing_order() {
    let bus = EventBus::new(config());
    let seen = recorder(&bus, "tick");

    for p in 1..=6u8 {
        bus.publish("tick", json!(p), PublishOptions::new().priority(Priority::new(p)))
            .unwrap();
    }
    assert!(bus.wait_idle(Duration::from_secs(5)).await);

    let order: Vec<u64> = seen.lock().unwrap().iter().filter_map(Value::as_u64).collect();
    assert_eq!(order, vec![6, 5, 4, 3, 2, 1]);
}

#[tokio::test]
async fn equal_priority_preserves_submission_order() {
    let bus = EventBus::new(config());
    let seen = recorder(&bus, "tick");

    for seq in 0..5 {
        bus.publish("tick", json!(seq), PublishOptions::new()).unwrap();
    }
    bus.publish("tick", json!("urgent"), PublishOptions::new().priority(Priority::HIGH))
        .unwrap();
    assert!(bus.wait_idle(Duration::from_secs(5)).await);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![json!("urgent"), json!(0), json!(1), json!(2), json!(3), json!(4)]);
}

#[tokio::test]
async fn handlers_run_in_registration_priority_order() {
    let bus = EventBus::new(config());
    let order = Arc::new(Mutex::new(Vec::new()));
    for (name, priority) in [("low", Priority::LOW), ("high", Priority::HIGH), ("normal", Priority::NORMAL)] {
        let order = order.clone();
        bus.register(
            "tick",
            handler_fn(move |_| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(name);
                    Ok(())
                }
            }),
            HandlerOptions::new().priority(priority),
        )
        .unwrap();
    }

    bus.publish("tick", Value::Null, PublishOptions::new()).unwrap();
    assert!(bus.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(*order.lock().unwrap(), vec!["high", "normal", "low"]);
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_after_threshold_and_admits_one_trial_after_reset() {
    let bus = EventBus::new(BusConfig {
        breaker_failure_threshold: 3,
        breaker_reset_ms: 60_000,
        ..config()
    });
    let calls = Arc::new(AtomicUsize::new(0));
    always_failing(&bus, "assign", calls.clone());

    for _ in 0..3 {
        bus.publish("assign", Value::Null, PublishOptions::new()).unwrap();
    }
    assert!(bus.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(bus.handlers()[0].breaker.state, BreakerState::Open);

    // Fourth event: not delivered.
    bus.publish("assign", Value::Null, PublishOptions::new()).unwrap();
    assert!(bus.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(bus.stats().skipped_by_breaker, 1);

    tokio::time::advance(Duration::from_secs(61)).await;

    // Exactly one trial; it fails and the breaker reopens.
    bus.publish("assign", Value::Null, PublishOptions::new()).unwrap();
    bus.publish("assign", Value::Null, PublishOptions::new()).unwrap();
    assert!(bus.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let info = &bus.handlers()[0];
    assert_eq!(info.breaker.state, BreakerState::Open);
    assert_eq!(info.breaker.times_opened, 2);
}

#[tokio::test(start_paused = true)]
async fn half_open_success_closes_the_breaker() {
    let bus = EventBus::new(BusConfig {
        breaker_failure_threshold: 2,
        breaker_reset_ms: 1_000,
        ..config()
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    bus.register(
        "assign",
        handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HandlerError::failed("transient"))
                } else {
                    Ok(())
                }
            }
        }),
        HandlerOptions::new().retries(0),
    )
    .unwrap();

    bus.publish("assign", Value::Null, PublishOptions::new()).unwrap();
    bus.publish("assign", Value::Null, PublishOptions::new()).unwrap();
    assert!(bus.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(bus.handlers()[0].breaker.state, BreakerState::Open);

    tokio::time::advance(Duration::from_millis(1_500)).await;
    bus.publish("assign", Value::Null, PublishOptions::new()).unwrap();
    bus.publish("assign", Value::Null, PublishOptions::new()).unwrap();
    assert!(bus.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(bus.handlers()[0].breaker.state, BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn slow_handler_is_timed_out_and_dead_lettered() {
    let bus = EventBus::new(config());
    bus.register(
        "slow",
        handler_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }),
        HandlerOptions::new().timeout(Duration::from_secs(1)).retries(0),
    )
    .unwrap();

    bus.publish("slow", Value::Null, PublishOptions::new()).unwrap();
    assert!(bus.wait_idle(Duration::from_secs(10)).await);

    let stats = bus.stats();
    assert_eq!(stats.timed_out, 1);
    let dead = bus.dead_letters();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.contains("timed out"), "{}", dead[0].reason);
}

#[tokio::test(start_paused = true)]
async fn events_older_than_their_timeout_are_dead_lettered_unhandled() {
    let bus = EventBus::new(config());
    bus.register(
        "slow",
        handler_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(())
        }),
        HandlerOptions::new().timeout(Duration::from_secs(10)),
    )
    .unwrap();
    let fast = recorder(&bus, "fast");

    bus.publish("slow", Value::Null, PublishOptions::new()).unwrap();
    bus.publish("fast", json!(1), PublishOptions::new().timeout(Duration::from_secs(1)))
        .unwrap();
    assert!(bus.wait_idle(Duration::from_secs(10)).await);

    assert!(fast.lock().unwrap().is_empty());
    assert_eq!(bus.stats().expired, 1);
    let dead = bus.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event.event_type, "fast");
    assert!(dead[0].handler_id.is_none());
}

#[tokio::test]
async fn replay_redelivers_with_fresh_attempt_counter() {
    let bus = EventBus::new(config());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    bus.register(
        "sync",
        handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(HandlerError::failed("first delivery fails"))
                } else {
                    Ok(())
                }
            }
        }),
        HandlerOptions::new().retries(0),
    )
    .unwrap();

    let original = bus.publish("sync", json!({"spec": "SPEC-1"}), PublishOptions::new()).unwrap();
    assert!(bus.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(bus.dead_letters().len(), 1);

    let replayed = bus.replay_dead_letter(Some(&[original.clone()])).unwrap();
    assert_eq!(replayed.len(), 1);
    assert_ne!(replayed[0], original);
    assert!(bus.wait_idle(Duration::from_secs(5)).await);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(bus.dead_letters().is_empty());
    assert_eq!(bus.stats().replayed, 1);
}

#[tokio::test]
async fn replay_with_unknown_ids_is_a_no_op() {
    let bus = EventBus::new(config());
    let replayed = bus.replay_dead_letter(Some(&["nope".to_string()])).unwrap();
    assert!(replayed.is_empty());
}

#[tokio::test]
async fn dead_letter_overflow_is_reported_as_system_error() {
    let bus = EventBus::new(BusConfig {
        dead_letter_capacity: 1,
        ..config()
    });
    let errors = recorder(&bus, topics::SYSTEM_ERROR);
    always_failing(&bus, "sync", Arc::new(AtomicUsize::new(0)));

    bus.publish("sync", json!(1), PublishOptions::new()).unwrap();
    bus.publish("sync", json!(2), PublishOptions::new()).unwrap();
    assert!(bus.wait_idle(Duration::from_secs(5)).await);

    let errors = errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["component"], "event_bus");
    assert_eq!(bus.dead_letters().len(), 1);
}

#[tokio::test]
async fn health_reflects_open_breakers_and_dead_letters() {
    let bus = EventBus::new(BusConfig {
        breaker_failure_threshold: 1,
        ..config()
    });
    assert_eq!(bus.health().status, accord_core::HealthStatus::Healthy);

    always_failing(&bus, "sync", Arc::new(AtomicUsize::new(0)));
    bus.publish("sync", Value::Null, PublishOptions::new()).unwrap();
    assert!(bus.wait_idle(Duration::from_secs(5)).await);

    let health = bus.health();
    assert_eq!(health.status, accord_core::HealthStatus::Error);
    assert!(health.issues.iter().any(|i| i.contains("circuit open")));
}

#[tokio::test(start_paused = true)]
async fn retried_event_goes_ahead_of_later_events_of_its_priority() {
    let bus = EventBus::new(config());
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let a_attempts = Arc::new(AtomicUsize::new(0));
    {
        let delivered = delivered.clone();
        bus.register(
            "job",
            handler_fn(move |event| {
                let delivered = delivered.clone();
                let a_attempts = a_attempts.clone();
                async move {
                    let name = event.data.as_str().unwrap_or_default().to_string();
                    if name == "a" && a_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(HandlerError::failed("first attempt fails"));
                    }
                    if name == "b" {
                        // a's retry (10ms backoff) is queued while b runs.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    delivered.lock().unwrap().push(name);
                    Ok(())
                }
            }),
            HandlerOptions::new(),
        )
        .unwrap();
    }

    for name in ["a", "b", "c"] {
        bus.publish("job", json!(name), PublishOptions::new()).unwrap();
    }
    assert!(bus.wait_idle(Duration::from_secs(5)).await);

    assert_eq!(*delivered.lock().unwrap(), vec!["b", "a", "c"]);
    assert_eq!(bus.stats().retried, 1);
}

#[tokio::test(start_paused = true)]
async fn retries_do_not_reset_an_events_age() {
    let bus = EventBus::new(BusConfig {
        backoff_base_ms: 400,
        backoff_max_ms: 400,
        ..config()
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    bus.register(
        "sync",
        handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::failed("store unavailable"))
            }
        }),
        HandlerOptions::new().retries(10),
    )
    .unwrap();

    bus.publish(
        "sync",
        Value::Null,
        PublishOptions::new().retries(10).timeout(Duration::from_secs(1)),
    )
    .unwrap();
    assert!(bus.wait_idle(Duration::from_secs(30)).await);

    // Attempts at 0, 400 and 800ms; the retry due at 1200ms is too old.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(bus.stats().expired, 1);
    let dead = bus.dead_letters();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].handler_id.is_none());
    assert_eq!(dead[0].event.metadata.attempt, 4);
}

#[tokio::test(start_paused = true)]
async fn detached_work_outlives_a_handler_timeout() {
    let bus = EventBus::new(config());
    let finished = Arc::new(AtomicUsize::new(0));
    let done = finished.clone();
    bus.register(
        "sync",
        handler_fn(move |_| {
            let done = done.clone();
            async move {
                detached(async move {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }
        }),
        HandlerOptions::new().timeout(Duration::from_secs(1)).retries(0),
    )
    .unwrap();

    bus.publish("sync", Value::Null, PublishOptions::new()).unwrap();
    assert!(bus.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(bus.stats().timed_out, 1);
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}
