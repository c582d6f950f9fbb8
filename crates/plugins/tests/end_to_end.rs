//! Built-in plugins wired to real file buffers: a log file flowing to a
//! directory on one node, and a socket hop between two nodes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use instalog_buffer::{BufferOptions, SimpleFileBuffer};
use instalog_core::args::validate_args;
use instalog_core::buffer::{BufferEventStream, BufferPlugin};
use instalog_core::event::Event;
use instalog_core::plugin::{ContextConfig, DynPlugin, PluginContext, PluginKind, PluginStore};
use instalog_core::policy::FlowPolicy;
use instalog_plugins::{input_log_file, input_socket, output_file, output_socket};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

fn context(
    plugin_id: &str,
    kind: PluginKind,
    data_dir: &Path,
    buffer: Arc<dyn BufferPlugin>,
) -> PluginContext {
    std::fs::create_dir_all(data_dir).unwrap();
    PluginContext::new(ContextConfig {
        plugin_id: plugin_id.to_owned(),
        module: "test".to_owned(),
        kind,
        node_id: "node-1".to_owned(),
        data_dir: data_dir.to_path_buf(),
        args: Default::default(),
        store: PluginStore::in_memory(),
        buffer: Some(buffer),
        policy: Arc::new(FlowPolicy::allow_all()),
        stop: CancellationToken::new(),
    })
}

fn build(
    factory: &instalog_core::plugin::PluginFactory,
    args: Value,
) -> Box<dyn DynPlugin> {
    let args = validate_args(factory.args, &args).unwrap();
    match factory.constructor {
        instalog_core::plugin::Constructor::Input(ctor)
        | instalog_core::plugin::Constructor::Output(ctor) => ctor(&args).unwrap(),
        instalog_core::plugin::Constructor::Buffer(_) => panic!("not a runnable plugin"),
    }
}

fn open_buffer(dir: &Path) -> Arc<SimpleFileBuffer> {
    Arc::new(SimpleFileBuffer::open(dir, BufferOptions::default()).unwrap())
}

async fn wait_for_seq(buffer: &SimpleFileBuffer, seq: u64) {
    let mut produced = buffer.subscribe();
    tokio::time::timeout(Duration::from_secs(10), produced.wait_for(|s| *s >= seq))
        .await
        .expect("buffer did not reach the expected sequence")
        .unwrap();
}

// =============================================================================
// log file → buffer → directory
// =============================================================================

#[tokio::test]
async fn log_lines_reach_the_output_directory() {
    // Given: a log with two good lines around a broken one
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("station.log");
    std::fs::write(
        &log,
        "{\"serial\": \"SN1\"}\n{\"serial\": \n{\"serial\": \"SN2\"}\n",
    )
    .unwrap();
    let target = dir.path().join("archive");

    let buffer = open_buffer(&dir.path().join("buffer"));
    buffer.add_consumer("archive").unwrap();

    let input_ctx = context("station_log", PluginKind::Input, &dir.path().join("in"), buffer.clone());
    let output_ctx = context("archive", PluginKind::Output, &dir.path().join("out"), buffer.clone());
    output_ctx.set_flushing(true);

    let mut input = build(
        &input_log_file::FACTORY,
        json!({"path": log.to_str().unwrap(), "poll_interval": 0.01}),
    );
    let mut output = build(
        &output_file::FACTORY,
        json!({"target_dir": target.to_str().unwrap()}),
    );

    // When: one pass of each plugin
    input.set_up(&input_ctx).await.unwrap();
    input.main(&input_ctx).await.unwrap();
    output.set_up(&output_ctx).await.unwrap();
    output.main(&output_ctx).await.unwrap();

    // Then: both good lines are in the output file with full history
    let written = std::fs::read_to_string(target.join(output_file::EVENTS_FILE)).unwrap();
    let events: Vec<Event> = written.lines().map(|l| Event::deserialize(l).unwrap()).collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].get("serial"), Some(&json!("SN2")));
    let hops: Vec<&str> = events[0].history().iter().map(|s| s.plugin_id.as_str()).collect();
    assert_eq!(hops, vec!["station_log", "archive"]);

    // And: offsets and progress are recorded
    assert_eq!(
        input_ctx.store().get(input_log_file::DROPPED_KEY),
        Some(json!(1)),
        "broken line should be counted"
    );
    let progress = output_ctx.progress().unwrap();
    assert_eq!(progress.completed, progress.total);
    assert_eq!(output_ctx.store().get(output_file::EVENTS_KEY), Some(json!(2)));
}

#[tokio::test]
async fn input_resumes_from_stored_offset() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("station.log");
    std::fs::write(&log, "{\"n\": 1}\n").unwrap();
    let buffer = open_buffer(&dir.path().join("buffer"));
    let ctx = context("tail", PluginKind::Input, &dir.path().join("in"), buffer.clone());
    let mut input = build(
        &input_log_file::FACTORY,
        json!({"path": log.to_str().unwrap(), "poll_interval": 0.01}),
    );

    input.main(&ctx).await.unwrap();
    std::fs::write(&log, "{\"n\": 1}\n{\"n\": 2}\n").unwrap();
    input.main(&ctx).await.unwrap();

    assert_eq!(buffer.last_seq(), 2, "first line must not be read twice");
    assert_eq!(ctx.store().get(input_log_file::OFFSET_KEY), Some(json!(18)));
}

// =============================================================================
// node A output_socket → node B input_socket
// =============================================================================

#[tokio::test]
async fn socket_hop_carries_events_and_attachments() {
    let dir = tempfile::tempdir().unwrap();

    // Given: node B listening on an ephemeral port
    let buffer_b = open_buffer(&dir.path().join("b_buffer"));
    buffer_b.add_consumer("reader").unwrap();
    let receiver_ctx = context("uplink_in", PluginKind::Input, &dir.path().join("b_in"), buffer_b.clone());
    let mut receiver = build(
        &input_socket::FACTORY,
        json!({"hostname": "127.0.0.1", "port": 0}),
    );
    receiver.set_up(&receiver_ctx).await.unwrap();
    let addr = receiver_ctx
        .store()
        .get(input_socket::LISTEN_ADDR_KEY)
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap();
    let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();

    let serving_ctx = receiver_ctx.clone();
    let server = tokio::spawn(async move {
        while !serving_ctx.is_stopping() {
            receiver.main(&serving_ctx).await.unwrap();
        }
        receiver.tear_down(&serving_ctx).await.unwrap();
    });

    // And: node A holding two events, one with an attachment
    let buffer_a = open_buffer(&dir.path().join("a_buffer"));
    buffer_a.add_consumer("uplink").unwrap();
    let report = dir.path().join("report.txt");
    std::fs::write(&report, b"fixture report").unwrap();
    buffer_a
        .produce(vec![
            Event::from_value(json!({"serial": "SN1"}))
                .unwrap()
                .with_attachment("report", &report),
            Event::from_value(json!({"serial": "SN2"})).unwrap(),
        ])
        .unwrap();

    let sender_ctx = context("uplink", PluginKind::Output, &dir.path().join("a_out"), buffer_a.clone());
    sender_ctx.set_flushing(true);
    let mut sender = build(
        &output_socket::FACTORY,
        json!({"hostname": "127.0.0.1", "port": port, "connect_timeout": 5.0}),
    );

    // When
    sender.set_up(&sender_ctx).await.unwrap();
    sender.main(&sender_ctx).await.unwrap();

    // Then: node A committed, node B holds both events
    let progress = sender_ctx.progress().unwrap();
    assert_eq!(progress.completed, 2, "sender should commit after the ack");
    wait_for_seq(&buffer_b, 2).await;

    let mut stream = buffer_b.open_stream("reader").unwrap();
    let first = stream.next().unwrap().unwrap();
    let second = stream.next().unwrap().unwrap();
    assert_eq!(first.get("serial"), Some(&json!("SN1")));
    assert_eq!(second.get("serial"), Some(&json!("SN2")));
    let copied = &first.attachments()["report"];
    assert_eq!(std::fs::read(copied).unwrap(), b"fixture report");
    assert!(copied.starts_with(buffer_b.dir()), "attachment lives in node B's buffer");
    let hops: Vec<&str> = first.history().iter().map(|s| s.plugin_id.as_str()).collect();
    assert_eq!(hops, vec!["uplink", "uplink_in"], "history crosses the hop");
    drop(stream);

    receiver_ctx.stop_token().cancel();
    server.await.unwrap();
}

#[tokio::test]
async fn unreachable_receiver_keeps_events_buffered() {
    let dir = tempfile::tempdir().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let buffer = open_buffer(&dir.path().join("buffer"));
    buffer.add_consumer("uplink").unwrap();
    buffer
        .produce(vec![Event::from_value(json!({"n": 1})).unwrap()])
        .unwrap();
    let ctx = context("uplink", PluginKind::Output, &dir.path().join("out"), buffer.clone());
    ctx.set_flushing(true);
    let mut sender = build(
        &output_socket::FACTORY,
        json!({"hostname": "127.0.0.1", "port": port, "connect_timeout": 1.0}),
    );

    sender.set_up(&ctx).await.unwrap();
    let err = sender.main(&ctx).await.unwrap_err();

    assert!(err.to_string().contains("delivery failed"), "got: {err}");
    assert_eq!(ctx.progress().unwrap().completed, 0);
    sender.main(&ctx).await.unwrap_err();
    assert_eq!(ctx.progress().unwrap().pending(), 1, "event is redelivered, not lost");
}
