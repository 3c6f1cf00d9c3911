//! Single-flight deduplication, deadlines and cancellation.

mod common;

use common::{config, key, node, store, FakeDriver, RecordingMetrics, ScriptedHeuristic};
use eoka_resolver::{Error, HeuristicMatch, Layer, LayeredResolver, ManualClock, RequestCoordinator, ResolveOptions};
use std::sync::Arc;
use std::time::Duration;

fn coordinator(
    heuristic: Arc<ScriptedHeuristic>,
    metrics: Arc<RecordingMetrics>,
) -> Arc<RequestCoordinator> {
    let config = config();
    let driver = FakeDriver::new();
    driver.put(node("button.send", "button"));
    let resolver = LayeredResolver::new(driver, store(Arc::new(ManualClock::new(0))), &config)
        .with_heuristic("send", heuristic)
        .with_metrics(metrics);
    Arc::new(RequestCoordinator::new(resolver, &config.resolver))
}

#[tokio::test(start_paused = true)]
async fn concurrent_calls_share_one_resolution() {
    let heuristic = ScriptedHeuristic::slow(
        "slow",
        HeuristicMatch::bare(node("button.send", "button")),
        Duration::from_millis(50),
    );
    let metrics = RecordingMetrics::new();
    let coord = coordinator(heuristic.clone(), metrics.clone());
    let k = key("send");

    let (a, b, c, d, e) = tokio::join!(
        coord.resolve(&k, ResolveOptions::default()),
        coord.resolve(&k, ResolveOptions::default()),
        coord.resolve(&k, ResolveOptions::default()),
        coord.resolve(&k, ResolveOptions::default()),
        coord.resolve(&k, ResolveOptions::default()),
    );
    let first = a.unwrap();
    for other in [b, c, d, e] {
        assert_eq!(other.unwrap(), first);
    }
    assert_eq!(heuristic.calls(), 1);
    assert_eq!(metrics.count("resolved"), 1);
    assert_eq!(coord.in_flight(), 0);

    // Once settled, the next call is a fresh (cached) resolution.
    let again = coord.resolve(&k, ResolveOptions::default()).await.unwrap();
    assert_eq!(again.layer(), Layer::Cached);
    assert_eq!(heuristic.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn different_keys_do_not_share() {
    let heuristic = ScriptedHeuristic::slow(
        "slow",
        HeuristicMatch::bare(node("button.send", "button")),
        Duration::from_millis(50),
    );
    let config = config();
    let resolver = LayeredResolver::new(FakeDriver::new(), store(Arc::new(ManualClock::new(0))), &config)
        .with_heuristic("send", heuristic.clone());
    let coord = RequestCoordinator::new(resolver, &config.resolver);

    let key_a = key("send");
    let key_b = eoka_resolver::ResolutionKey::new("claude", "send");
    let (a, b) = tokio::join!(
        coord.resolve(&key_a, ResolveOptions::default()),
        coord.resolve(&key_b, ResolveOptions::default()),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(heuristic.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn waiters_receive_the_leaders_error() {
    let metrics = RecordingMetrics::new();
    let coord = coordinator(ScriptedHeuristic::never("none"), metrics.clone());
    let k = key("send");

    let (a, b) = tokio::join!(
        coord.resolve(&k, ResolveOptions::default()),
        coord.resolve(&k, ResolveOptions::default()),
    );
    let (a, b) = (a.unwrap_err(), b.unwrap_err());
    assert!(matches!(a, Error::AllLayersExhausted(_)));
    assert_eq!(a.trace(), b.trace());
    assert_eq!(metrics.count("exhausted"), 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_produces_timeout_not_exhaustion() {
    let heuristic = ScriptedHeuristic::slow(
        "stuck",
        HeuristicMatch::bare(node("button.send", "button")),
        Duration::from_secs(30),
    );
    let metrics = RecordingMetrics::new();
    let coord = coordinator(heuristic, metrics.clone());
    let k = key("send");

    let opts = ResolveOptions::default().with_deadline(Duration::from_millis(500));
    let err = coord.resolve(&k, opts).await.unwrap_err();
    match err {
        Error::Timeout { key, after_ms } => {
            assert_eq!(key, k);
            assert!(after_ms >= 500);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(metrics.count("timed_out"), 1);
    assert_eq!(metrics.count("exhausted"), 0);
    assert_eq!(coord.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn discovery_budget_inside_deadline_is_exhaustion() {
    let metrics = RecordingMetrics::new();
    let coord = coordinator(ScriptedHeuristic::never("none"), metrics.clone());

    // Discovery budget (1s) elapses well before the 5s deadline.
    let err = coord.resolve(&key("send"), ResolveOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::AllLayersExhausted(_)));
    assert_eq!(metrics.count("timed_out"), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_all_releases_leader_and_waiters() {
    let coord = coordinator(ScriptedHeuristic::never("none"), RecordingMetrics::new());
    let k = key("send");

    let leader = tokio::spawn({
        let coord = coord.clone();
        let k = k.clone();
        async move { coord.resolve(&k, ResolveOptions::default()).await }
    });
    let waiter = tokio::spawn({
        let coord = coord.clone();
        let k = k.clone();
        async move { coord.resolve(&k, ResolveOptions::default()).await }
    });

    // Both are parked in the heuristic backoff by now.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(coord.in_flight(), 1);
    coord.cancel_all();

    assert!(matches!(leader.await.unwrap(), Err(Error::Cancelled)));
    assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
    assert_eq!(coord.in_flight(), 0);

    let after = coord.resolve(&k, ResolveOptions::default()).await;
    assert!(matches!(after, Err(Error::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn abandoned_leader_still_answers_waiters() {
    let heuristic = ScriptedHeuristic::slow(
        "slow",
        HeuristicMatch::bare(node("button.send", "button")),
        Duration::from_secs(1),
    );
    let metrics = RecordingMetrics::new();
    let coord = coordinator(heuristic.clone(), metrics.clone());
    let k = key("send");

    let (leader, waiter) = tokio::join!(
        tokio::time::timeout(Duration::from_millis(50), coord.resolve(&k, ResolveOptions::default())),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            coord.resolve(&k, ResolveOptions::default()).await
        },
    );

    assert!(leader.is_err());
    let found = waiter.unwrap();
    assert_eq!(found.layer(), Layer::Heuristic);
    assert_eq!(heuristic.calls(), 1);
    assert_eq!(metrics.count("cancelled"), 0);
    assert_eq!(coord.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn waiter_observes_its_own_deadline() {
    let heuristic = ScriptedHeuristic::slow(
        "slow",
        HeuristicMatch::bare(node("button.send", "button")),
        Duration::from_secs(3),
    );
    let metrics = RecordingMetrics::new();
    let coord = coordinator(heuristic, metrics.clone());
    let k = key("send");

    let (leader, waiter) = tokio::join!(coord.resolve(&k, ResolveOptions::default()), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let started = tokio::time::Instant::now();
        let opts = ResolveOptions::default().with_deadline(Duration::from_millis(100));
        (coord.resolve(&k, opts).await, started.elapsed())
    });

    let (waited, elapsed) = waiter;
    match waited {
        Err(Error::Timeout { key, after_ms }) => {
            assert_eq!(key, k);
            assert_eq!(after_ms, 100);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(elapsed, Duration::from_millis(100));
    assert!(leader.is_ok());
    assert_eq!(metrics.count("timed_out"), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_reaches_metrics() {
    let metrics = RecordingMetrics::new();
    let coord = coordinator(ScriptedHeuristic::never("none"), metrics.clone());
    let k = key("send");

    let (result, _) = tokio::join!(coord.resolve(&k, ResolveOptions::default()), async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        coord.cancel_all();
    });
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(metrics.count("cancelled"), 1);
}
