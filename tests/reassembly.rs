//! End-to-end reassembly through the public API with the built-in parsers.

use std::sync::Arc;
use std::time::Duration;

use flowstitch::{
    ChannelSink, ChannelSource, ExitReason, FlowId, Fragment, MessageRecord, ParserType, Pipeline,
    ProcessStatus, ReassemblyError, WorkerConfig, WorkerEvent, WorkerRegistry, WriterSink, hexdump,
};
use futures::FutureExt;
use tokio::sync::mpsc::UnboundedReceiver;

fn registry(config: WorkerConfig) -> (WorkerRegistry, UnboundedReceiver<MessageRecord>) {
    let _ = tracing_subscriber::fmt::try_init();
    let (sink, records) = ChannelSink::new();
    let registry = WorkerRegistry::new(config, Arc::new(sink)).expect("valid config");
    (registry, records)
}

fn fragment(flow: &str, payload: &[u8]) -> Fragment {
    Fragment::new(flow, payload.to_vec())
}

#[tokio::test(start_paused = true)]
async fn http_request_split_across_three_fragments() -> anyhow::Result<()> {
    let (registry, mut records) = registry(WorkerConfig::default());

    registry.dispatch(fragment("F1", b"POST /submit HTTP/1.1\r\nHost: exa")).await?;
    registry.dispatch(fragment("F1", b"mple.com\r\nContent-Length: 9\r\n\r\nfield")).await?;
    registry.dispatch(fragment("F1", b"=abc")).await?;

    let record = tokio::time::timeout(Duration::from_millis(500), records.recv())
        .await?
        .expect("sink open");
    assert_eq!(record.flow_id, FlowId::from("F1"));
    assert_eq!(record.parser_name, "HTTPRequest");
    assert_eq!(record.parser_type, ParserType::HttpRequest);
    assert!(record.body_lossy().ends_with("\r\n\r\nfield=abc"));

    let worker = registry.worker(&FlowId::from("F1")).expect("flow still live");
    assert_eq!(worker.state().status, ProcessStatus::Init);
    assert!(records.try_recv().is_err(), "exactly one record expected");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn keep_alive_flow_emits_messages_in_order() -> anyhow::Result<()> {
    let (registry, mut records) = registry(WorkerConfig::default());

    registry.dispatch(fragment("F1", b"GET /one HTTP/1.1\r\n\r\n")).await?;
    registry.dispatch(fragment("F1", b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")).await?;
    registry.dispatch(fragment("F1", b"GET /two HTTP/1.1\r\n\r\n")).await?;

    let mut names = Vec::new();
    for _ in 0..3 {
        let record = records.recv().await.expect("sink open");
        names.push((record.parser_name, record.body_lossy().lines().next().map(str::to_owned)));
    }
    assert_eq!(
        names,
        vec![
            ("HTTPRequest", Some("GET /one HTTP/1.1".to_owned())),
            ("HTTPResponse", Some("HTTP/1.1 200 OK".to_owned())),
            ("HTTPRequest", Some("GET /two HTTP/1.1".to_owned())),
        ]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_flow_is_flushed_once_and_evicted() -> anyhow::Result<()> {
    let (registry, mut records) = registry(WorkerConfig::default());
    let mut events = registry.subscribe();

    registry.dispatch(fragment("F1", b"HTTP/1.0 200 OK\r\n\r\nbody until close")).await?;
    let worker = registry.worker(&FlowId::from("F1")).expect("worker spawned");
    worker.closed().await;

    let record = records.recv().await.expect("sink open");
    assert_eq!(record.parser_type, ParserType::HttpResponse);
    assert!(records.try_recv().is_err());

    let mut exits = 0;
    while let Ok(event) = events.try_recv() {
        if let WorkerEvent::Exited(exit) = event {
            assert!(matches!(exit.reason, ExitReason::Idle));
            exits += 1;
        }
    }
    assert_eq!(exits, 1);
    assert!(registry.is_empty());
    assert!(matches!(
        worker.submit(fragment("F1", b"late")).await,
        Err(ReassemblyError::WorkerClosed { .. })
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn seventeenth_fragment_waits_for_the_worker() -> anyhow::Result<()> {
    let (registry, mut records) = registry(WorkerConfig::default());

    // the worker task cannot run until this task yields, so nothing drains yet
    for i in 0..16 {
        registry.dispatch(fragment("F1", format!("frag-{i:02}").as_bytes())).await?;
    }
    let blocked = registry.dispatch(fragment("F1", b"frag-16")).now_or_never();
    assert!(blocked.is_none(), "17th dispatch must wait for queue space");

    tokio::task::yield_now().await;
    registry.dispatch(fragment("F1", b"frag-16")).await?;

    for i in 0..17 {
        let record = records.recv().await.expect("sink open");
        assert_eq!(record.body, format!("frag-{i:02}").into_bytes());
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn hex_dump_mode_through_pipeline() -> anyhow::Result<()> {
    let (registry, mut records) = registry(WorkerConfig::default().with_hex_dump(true));
    let (tx, source) = ChannelSource::new(4);
    let pipeline = Pipeline::spawn(source, registry);

    let request = b"GET /hex HTTP/1.1\r\n\r\n";
    tx.send(fragment("F2", request)).await?;
    drop(tx);
    assert_eq!(pipeline.finish().await, 1);

    let record = records.recv().await.expect("sink open");
    assert_eq!(record.body, hexdump(request).into_bytes());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn writer_sink_receives_formatted_records() -> anyhow::Result<()> {
    let sink = Arc::new(WriterSink::new(Vec::new()));
    let registry = WorkerRegistry::new(WorkerConfig::default(), sink.clone())?;

    registry.dispatch(fragment("F3", b"\x16\x03\x01\x00\x05hello")).await?;
    registry.shutdown().await;
    drop(registry);

    let sink = Arc::try_unwrap(sink).map_err(|_| anyhow::anyhow!("sink still shared"))?;
    let text = String::from_utf8(sink.into_inner())?;
    assert!(text.starts_with("Flow:F3, Name:DefaultParser, Type:0, Length:"));
    assert!(text.contains("00000000  16 03 01 00 05 68 65 6c  6c 6f"));
    Ok(())
}

#[test]
fn config_loads_from_yaml_file() -> anyhow::Result<()> {
    let path = std::env::temp_dir().join(format!("flowstitch-config-{}.yaml", std::process::id()));
    std::fs::write(&path, "queue_capacity: 32\nhex_dump: true\n")?;

    let config = WorkerConfig::from_yaml_file(&path)?;
    std::fs::remove_file(&path)?;

    assert_eq!(config.queue_capacity, 32);
    assert!(config.hex_dump);
    assert_eq!(config.idle_timeout(), Duration::from_secs(1));
    Ok(())
}
