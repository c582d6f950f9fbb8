//! Output-side behaviour over a real buffer: checkout protocol, flow-policy
//! filtering and the batcher's early-flush / oversize handling.

use std::sync::Arc;
use std::time::Duration;

use instalog_buffer::{BufferOptions, SimpleFileBuffer};
use instalog_core::batch::{BatchOutcome, BatchPolicy, OutputBatcher};
use instalog_core::buffer::BufferPlugin;
use instalog_core::error::StreamError;
use instalog_core::event::{Event, ProcessStage, TARGET_BUFFER, TARGET_EXTERNAL};
use instalog_core::plugin::PluginKind;
use instalog_core::policy::{FlowPolicy, RuleRegistry};
use instalog_core::stream::{EventStream, StageTemplate};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const OUTPUT: &str = "archive";

fn event_from(input: &str, n: u64) -> Event {
    let mut event = Event::from_value(json!({"n": n, "blob": "x".repeat(100)})).unwrap();
    event.append_stage(ProcessStage::now("node-1", input, PluginKind::Input, TARGET_BUFFER));
    event
}

fn setup(dir: &std::path::Path) -> SimpleFileBuffer {
    let buffer = SimpleFileBuffer::open(dir, BufferOptions::default()).unwrap();
    buffer.add_consumer(OUTPUT).unwrap();
    buffer
}

fn stream_with(buffer: &SimpleFileBuffer, policy: FlowPolicy) -> EventStream {
    EventStream::new(
        buffer.consume(OUTPUT).unwrap(),
        Arc::new(policy),
        StageTemplate {
            node_id: "node-1".into(),
            plugin_id: OUTPUT.into(),
        },
        buffer.subscribe(),
        CancellationToken::new(),
    )
}

fn batch_policy(max_count: usize, threshold_bytes: u64, max_bytes: u64) -> BatchPolicy {
    BatchPolicy {
        max_count,
        timeout: Duration::from_millis(50),
        threshold_bytes,
        max_bytes,
        ..BatchPolicy::default()
    }
}

// =============================================================================
// checkout protocol
// =============================================================================

#[tokio::test]
async fn second_next_before_commit_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = setup(dir.path());
    buffer.produce(vec![event_from("in1", 1)]).unwrap();
    let mut stream = stream_with(&buffer, FlowPolicy::allow_all());

    let first = stream.next(Duration::from_millis(50), 10).await.unwrap();
    assert_eq!(first.len(), 1);

    let err = stream.next(Duration::from_millis(50), 10).await.unwrap_err();
    assert!(matches!(err, StreamError::CheckoutPending { pending: 1 }), "{err}");

    assert_eq!(stream.commit().unwrap(), 1);
    assert!(stream.next(Duration::ZERO, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn delivered_events_carry_an_output_stage() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = setup(dir.path());
    buffer.produce(vec![event_from("in1", 1)]).unwrap();
    let mut stream = stream_with(&buffer, FlowPolicy::allow_all());

    let events = stream.next(Duration::from_millis(50), 10).await.unwrap();

    let history = events[0].history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].plugin_id, OUTPUT);
    assert_eq!(history[1].plugin_type, PluginKind::Output);
    assert_eq!(history[1].target, TARGET_EXTERNAL);
}

#[tokio::test]
async fn next_wakes_when_events_are_produced() {
    // Given: an empty buffer and a waiting stream
    let dir = tempfile::tempdir().unwrap();
    let buffer = setup(dir.path());
    let mut stream = stream_with(&buffer, FlowPolicy::allow_all());
    let producer = buffer.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.produce(vec![event_from("in1", 1)]).unwrap();
    });

    // When: next waits up to 5 s for a single event
    let started = std::time::Instant::now();
    let events = stream.next(Duration::from_secs(5), 1).await.unwrap();

    // Then: it returns as soon as max_count is reached
    assert_eq!(events.len(), 1);
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn aborted_events_are_redelivered() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = setup(dir.path());
    buffer.produce((1..=3).map(|n| event_from("in1", n)).collect()).unwrap();
    let mut stream = stream_with(&buffer, FlowPolicy::allow_all());

    let first = stream.next(Duration::ZERO, 10).await.unwrap();
    assert_eq!(stream.abort().unwrap(), 3);
    let second = stream.next(Duration::ZERO, 10).await.unwrap();

    let ns = |events: &[Event]| events.iter().map(|e| e.get("n").cloned()).collect::<Vec<_>>();
    assert_eq!(ns(&first), ns(&second));
}

// =============================================================================
// flow policy
// =============================================================================

#[tokio::test]
async fn filtered_events_are_skipped_and_committed_past() {
    // Given: events from two inputs, the output only accepts in1
    let dir = tempfile::tempdir().unwrap();
    let buffer = setup(dir.path());
    buffer
        .produce(vec![
            event_from("in2", 1),
            event_from("in1", 2),
            event_from("in2", 3),
        ])
        .unwrap();
    let policy = FlowPolicy::from_definitions(
        &RuleRegistry::with_builtins(),
        &[json!({"rule": "history", "plugin_id": "in1", "position": -1})],
        &[],
    )
    .unwrap();
    let mut stream = stream_with(&buffer, policy);

    // When
    let events = stream.next(Duration::from_millis(50), 10).await.unwrap();
    let committed = stream.commit().unwrap();

    // Then: one delivered, and the consumer moved past all three
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].get("n"), Some(&json!(2)));
    assert_eq!(committed, 1);
    let progress = buffer.progress(OUTPUT).unwrap();
    assert_eq!(progress.completed, 3);
    assert_eq!(progress.pending(), 0);
}

#[tokio::test]
async fn only_filtered_events_do_not_stall_the_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = setup(dir.path());
    buffer.produce(vec![event_from("other", 1)]).unwrap();
    let policy = FlowPolicy::from_definitions(
        &RuleRegistry::with_builtins(),
        &[json!({"rule": "history", "plugin_id": "in1"})],
        &[],
    )
    .unwrap();
    let mut stream = stream_with(&buffer, policy);

    let events = stream.next(Duration::ZERO, 10).await.unwrap();

    assert!(events.is_empty());
    assert_eq!(stream.pending(), 0, "no checkout is left open");
    assert_eq!(buffer.progress(OUTPUT).unwrap().completed, 1);
}

// =============================================================================
// batching
// =============================================================================

#[tokio::test]
async fn batch_over_threshold_is_flushed_early() {
    // Given: ~120 byte events, threshold 200, max 10_000
    let dir = tempfile::tempdir().unwrap();
    let buffer = setup(dir.path());
    buffer.produce((1..=5).map(|n| event_from("in1", n)).collect()).unwrap();
    let mut stream = stream_with(&buffer, FlowPolicy::allow_all());
    let mut batcher = OutputBatcher::new(batch_policy(100, 200, 10_000));

    // When
    let outcome = batcher.collect(&mut stream, false).await.unwrap();

    // Then: early flush with the two events that crossed the threshold
    match outcome {
        BatchOutcome::EarlyFlush(events) => assert_eq!(events.len(), 2),
        other => panic!("expected early flush, got {other:?}"),
    }
    assert_eq!(stream.commit().unwrap(), 2);
}

#[tokio::test]
async fn batch_over_max_bytes_is_aborted_and_redelivered() {
    // Given: five ~120 byte events and max_bytes 300
    let dir = tempfile::tempdir().unwrap();
    let buffer = setup(dir.path());
    buffer.produce((1..=5).map(|n| event_from("in1", n)).collect()).unwrap();
    let mut stream = stream_with(&buffer, FlowPolicy::allow_all());
    let mut batcher = OutputBatcher::new(batch_policy(10, 10_000, 300));

    // When: the first pull takes all five
    let outcome = batcher.collect(&mut stream, false).await.unwrap();

    // Then: aborted, nothing pending, count limit halved
    assert!(matches!(outcome, BatchOutcome::Oversize { .. }), "{outcome:?}");
    assert_eq!(stream.pending(), 0);
    assert_eq!(batcher.count_limit(), 5);
    assert_eq!(buffer.progress(OUTPUT).unwrap().completed, 0);

    // And: the same events come back on the next pulls, in smaller batches
    let again = batcher.collect(&mut stream, false).await.unwrap();
    assert!(matches!(again, BatchOutcome::Oversize { .. }));
    let fits = batcher.collect(&mut stream, false).await.unwrap();
    let events = fits.into_events().expect("two events fit under max_bytes");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].get("n"), Some(&json!(1)), "redelivered from the start");
}

#[tokio::test]
async fn oversize_backoff_doubles() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = setup(dir.path());
    buffer.produce((1..=8).map(|n| event_from("in1", n)).collect()).unwrap();
    let mut stream = stream_with(&buffer, FlowPolicy::allow_all());
    let mut batcher = OutputBatcher::new(batch_policy(8, 10_000, 150));

    let backoffs: Vec<Duration> = {
        let mut seen = Vec::new();
        for _ in 0..2 {
            if let BatchOutcome::Oversize { backoff, .. } = batcher.collect(&mut stream, false).await.unwrap() {
                seen.push(backoff);
            }
        }
        seen
    };

    assert_eq!(backoffs, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    assert_eq!(batcher.count_limit(), 2);
}

#[tokio::test]
async fn single_event_over_max_bytes_is_dropped_not_retried_forever() {
    // Given: every event alone is larger than max_bytes
    let dir = tempfile::tempdir().unwrap();
    let buffer = setup(dir.path());
    buffer.produce((1..=2).map(|n| event_from("in1", n)).collect()).unwrap();
    let mut stream = stream_with(&buffer, FlowPolicy::allow_all());
    let mut batcher = OutputBatcher::new(batch_policy(2, 10_000, 50));

    // When: the batcher shrinks down to one event per pull
    let mut outcomes = Vec::new();
    for _ in 0..4 {
        outcomes.push(batcher.collect(&mut stream, true).await.unwrap());
    }

    // Then: one oversize abort, then each event is dropped in turn
    assert!(matches!(outcomes[0], BatchOutcome::Oversize { .. }), "{:?}", outcomes[0]);
    assert!(matches!(outcomes[1], BatchOutcome::Dropped { .. }), "{:?}", outcomes[1]);
    assert!(matches!(outcomes[2], BatchOutcome::Dropped { .. }), "{:?}", outcomes[2]);
    assert!(matches!(outcomes[3], BatchOutcome::Empty), "{:?}", outcomes[3]);
    assert_eq!(stream.pending(), 0, "no checkout is left open");
    let progress = buffer.progress(OUTPUT).unwrap();
    assert_eq!(progress.completed, 2, "consumer moved past both events");
}

#[tokio::test]
async fn oversize_event_does_not_block_events_behind_it() {
    // Given: one huge event followed by a small one
    let dir = tempfile::tempdir().unwrap();
    let buffer = setup(dir.path());
    let huge = Event::from_value(json!({"n": 1, "blob": "x".repeat(1_000)})).unwrap();
    let small = Event::from_value(json!({"n": 2})).unwrap();
    buffer.produce(vec![huge, small]).unwrap();
    let mut stream = stream_with(&buffer, FlowPolicy::allow_all());
    let mut batcher = OutputBatcher::new(batch_policy(1, 10_000, 500));

    // When
    let first = batcher.collect(&mut stream, true).await.unwrap();
    let second = batcher.collect(&mut stream, true).await.unwrap();

    // Then
    assert!(matches!(first, BatchOutcome::Dropped { .. }), "{first:?}");
    let events = second.into_events().expect("small event is delivered");
    assert_eq!(events[0].get("n"), Some(&json!(2)));
    assert_eq!(stream.commit().unwrap(), 1);
}

#[tokio::test]
async fn empty_buffer_times_out_empty() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = setup(dir.path());
    let mut stream = stream_with(&buffer, FlowPolicy::allow_all());
    let mut batcher = OutputBatcher::new(batch_policy(10, 10_000, 100_000));

    let outcome = batcher.collect(&mut stream, false).await.unwrap();
    assert!(matches!(outcome, BatchOutcome::Empty));
}

#[tokio::test]
async fn partial_batch_times_out_with_events() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = setup(dir.path());
    buffer.produce(vec![event_from("in1", 1)]).unwrap();
    let mut stream = stream_with(&buffer, FlowPolicy::allow_all());
    let mut batcher = OutputBatcher::new(batch_policy(10, 10_000, 100_000));

    let outcome = batcher.collect(&mut stream, false).await.unwrap();
    assert!(matches!(outcome, BatchOutcome::TimedOut(ref e) if e.len() == 1), "{outcome:?}");
}
