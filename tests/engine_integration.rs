//! Engine integration tests: routing through a live graph, supervision and
//! hot reload, driven only through the public API.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use courier_core::engine::{ProductionEngine, StaticSource};
use courier_core::envelope::{RawParser, CONTENT_TYPE_HL7V2};
use courier_core::events::{EngineEvent, EventKind};
use courier_core::host::{Forward, HostContext, HostHooks, HostState};
use courier_core::types::{
    Backoff, EngineDefaults, ItemConfig, MessagingPattern, ProductionConfig, RestartMode,
    RestartPolicy,
};
use courier_core::{Envelope, Error, HostCatalog, ParserRegistry};

const ADT_A01: &str = "MSH|^~\\&|ADT|GOOD HEALTH|LAB|GOOD HEALTH|20240101120000||ADT^A01|MSG00001|P|2.4\rPID|||555-44-4444";

/// Sleeps before acknowledging.
#[derive(Debug)]
struct SlowHost(Duration);

#[async_trait]
impl HostHooks for SlowHost {
    async fn process_envelope(
        &self,
        _ctx: &HostContext,
        _envelope: &Envelope,
    ) -> courier_core::Result<Vec<Forward>> {
        tokio::time::sleep(self.0).await;
        Ok(Vec::new())
    }
}

/// Panics on every envelope.
#[derive(Debug)]
struct CrashingHost;

#[async_trait]
impl HostHooks for CrashingHost {
    async fn process_envelope(
        &self,
        _ctx: &HostContext,
        _envelope: &Envelope,
    ) -> courier_core::Result<Vec<Forward>> {
        panic!("segment parser blew up");
    }
}

fn parsers() -> Arc<ParserRegistry> {
    Arc::new(
        ParserRegistry::builder()
            .with_builtins()
            .register(CONTENT_TYPE_HL7V2, Arc::new(RawParser))
            .build(),
    )
}

fn engine() -> ProductionEngine {
    let catalog = HostCatalog::with_builtins()
        .register("slow", |_: &ItemConfig| {
            Ok(Arc::new(SlowHost(Duration::from_millis(500))) as Arc<dyn HostHooks>)
        })
        .register("crashing", |_: &ItemConfig| {
            Ok(Arc::new(CrashingHost) as Arc<dyn HostHooks>)
        });
    ProductionEngine::builder()
        .parsers(parsers())
        .catalog(catalog)
        .defaults(EngineDefaults {
            drain_deadline: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .build()
}

fn adt(destination: &str) -> Envelope {
    Envelope::hl7(&parsers(), ADT_A01, "2.4", "test-harness", destination).unwrap()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sync_send_times_out_against_slow_host() {
    let engine = engine();
    engine
        .start(ProductionConfig::new("lab", vec![ItemConfig::new("slow", "slow")]))
        .await
        .unwrap();

    let err = engine
        .send(adt("slow"), MessagingPattern::SyncReliable, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeliveryTimeout { ref target, .. } if target == "slow"));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forward_timeout_dead_letters_without_retries() {
    let engine = engine();
    let mut gateway = ItemConfig::new("gateway", "passthrough")
        .with_targets(["slow"])
        .with_messaging(MessagingPattern::SyncReliable, Duration::from_millis(100))
        .with_dead_letter("dlq");
    gateway.max_message_retries = 0;
    engine
        .start(ProductionConfig::new(
            "lab",
            vec![
                gateway,
                ItemConfig::new("slow", "slow"),
                ItemConfig::new("dlq", "sink"),
            ],
        ))
        .await
        .unwrap();
    let (_sub, mut dead_letters) = engine.events().subscribe(&[EventKind::MessageDeadLettered]);

    engine
        .send(adt("gateway"), MessagingPattern::AsyncReliable, Duration::from_secs(1))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), dead_letters.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        EngineEvent::MessageDeadLettered { ref item, ref target, .. }
            if item == "gateway" && target.as_deref() == Some("dlq")
    ));
    let dlq = engine.host("dlq").unwrap();
    wait_until(|| dlq.stats().processed == 1).await;
    let gateway = engine.host("gateway").unwrap().stats();
    assert_eq!(gateway.dead_lettered, 1);
    assert_eq!(gateway.retried, 0);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crashing_host_exhausts_restart_budget() {
    let engine = engine();
    let crashing = ItemConfig::new("crashing", "crashing").with_restart(RestartPolicy {
        mode: RestartMode::OnFailure,
        max_restarts: 2,
        delay: Duration::from_millis(10),
        backoff: Backoff::Fixed,
        max_delay: Duration::from_millis(10),
    });
    engine
        .start(ProductionConfig::new("lab", vec![crashing]))
        .await
        .unwrap();
    let mut failures = engine.subscribe_failures();

    engine
        .send(adt("crashing"), MessagingPattern::AsyncReliable, Duration::from_secs(1))
        .await
        .unwrap();

    let exhausted = tokio::time::timeout(Duration::from_secs(5), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        exhausted,
        Error::RestartExhausted { ref item, restarts: 2 } if item == "crashing"
    ));

    let host = engine.host("crashing").unwrap();
    wait_until(|| host.state() == HostState::Failed).await;
    assert!(matches!(
        engine
            .send(adt("crashing"), MessagingPattern::AsyncReliable, Duration::from_secs(1))
            .await,
        Err(Error::NotAccepting { .. })
    ));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reload_from_source_preserves_kept_queue() {
    let engine = engine();
    let source = StaticSource::new(ProductionConfig::new(
        "lab",
        vec![
            ItemConfig::new("adt-in", "passthrough").with_targets(["archive"]),
            ItemConfig::new("archive", "sink"),
            ItemConfig::new("legacy", "sink"),
        ],
    ));
    engine.start_from(&source).await.unwrap();
    let archive_queue = engine.host("archive").unwrap().queue().clone();

    source.set(ProductionConfig::new(
        "lab",
        vec![
            ItemConfig::new("adt-in", "passthrough").with_targets(["archive", "audit"]),
            ItemConfig::new("archive", "sink"),
            ItemConfig::new("audit", "sink"),
        ],
    ));
    let report = engine.reload_from(&source).await.unwrap();
    assert_eq!(report.added, ["audit"]);
    assert_eq!(report.replaced, ["adt-in"]);
    assert_eq!(report.removed, ["legacy"]);
    assert_eq!(report.kept, ["archive"]);
    assert!(Arc::ptr_eq(
        &archive_queue,
        engine.host("archive").unwrap().queue()
    ));

    engine
        .send(adt("adt-in"), MessagingPattern::SyncReliable, Duration::from_secs(5))
        .await
        .unwrap();
    let audit = engine.host("audit").unwrap();
    wait_until(|| audit.stats().processed == 1).await;

    assert!(matches!(
        engine
            .send(adt("legacy"), MessagingPattern::AsyncReliable, Duration::from_secs(1))
            .await,
        Err(Error::UnknownTarget(ref t)) if t == "legacy"
    ));

    let reports = engine.shutdown().await;
    let names: Vec<&str> = reports.iter().map(|r| r.item.as_str()).collect();
    assert_eq!(names, ["adt-in", "adt-in", "archive", "audit", "legacy"]);
    assert!(engine.stats().hosts.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalid_graph_is_rejected_before_start() {
    let engine = engine();
    let err = engine
        .start(ProductionConfig::new(
            "lab",
            vec![ItemConfig::new("adt-in", "passthrough").with_targets(["nowhere"])],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(engine.host("adt-in").is_none());
}
