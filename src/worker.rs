//! Per-flow event worker.
//!
//! Every flow gets one [`WorkerTask`] running on its own tokio task. The task
//! owns the inbound queue, the idle timer and the parser; nothing else touches
//! them. Callers interact through the cloneable [`EventWorker`] handle.
//!
//! The run loop waits on cancellation, the next fragment and the idle timer,
//! and handles exactly one of them per iteration:
//!
//! - fragment: reset the idle counter, detect a parser if no message is in
//!   progress, feed the bytes, flush when the parser reports completion
//! - tick: count an idle tick, evict the flow once the threshold is reached
//! - cancellation: forced shutdown
//!
//! Shutdown always closes the queue, flushes any partial message, and hands a
//! [`WorkerExit`] to the one-shot deregistration callback.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::WorkerConfig;
use crate::parser::{Parser, ParserFactory};
use crate::sink::{MessageRecord, OutputSink, hexdump};
use crate::types::{FlowId, Fragment, PacketType, ProcessStatus};
use crate::{ReassemblyError, Result};

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<WorkerConfig>,
    pub sink: Arc<dyn OutputSink>,
    pub parsers: Arc<dyn ParserFactory>,
    /// Forced-shutdown signal, usually a child of the registry token
    pub cancel: CancellationToken,
}

/// Called exactly once when a worker terminates.
pub type Deregister = Box<dyn FnOnce(WorkerExit) + Send + 'static>;

/// Snapshot of a worker, published after every handled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerState {
    pub status: ProcessStatus,
    pub packet_type: PacketType,
    pub idle_ticks: u32,
    /// Fragments handled so far
    pub fragments: u64,
    /// Messages flushed to the sink so far
    pub messages: u64,
    pub terminated: bool,
}

/// Why a worker stopped.
#[derive(Debug, Clone)]
pub enum ExitReason {
    /// No fragment for the configured number of ticks
    Idle,
    /// Forced shutdown through the cancellation token
    Cancelled,
    /// Every handle was dropped
    Detached,
    /// The parser rejected the flow's bytes
    Failed(Arc<ReassemblyError>),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Idle => f.write_str("idle"),
            ExitReason::Cancelled => f.write_str("cancelled"),
            ExitReason::Detached => f.write_str("detached"),
            ExitReason::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Summary handed to the deregistration callback.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub flow_id: FlowId,
    pub serial: u64,
    pub reason: ExitReason,
    pub fragments: u64,
    pub messages: u64,
}

/// Handle to a running flow worker.
#[derive(Debug, Clone)]
pub struct EventWorker {
    id: FlowId,
    serial: u64,
    inbound: mpsc::Sender<Fragment>,
    state: watch::Receiver<WorkerState>,
    cancel: CancellationToken,
}

impl EventWorker {
    /// Create a worker handle and the task that must be spawned to drive it.
    ///
    /// `serial` distinguishes successive workers of the same flow.
    pub fn new(
        id: FlowId,
        serial: u64,
        ctx: WorkerContext,
        deregister: Deregister,
    ) -> (Self, WorkerTask) {
        let (tx, rx) = mpsc::channel(ctx.config.queue_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(WorkerState::default());

        let handle = Self { id: id.clone(), serial, inbound: tx, state: state_rx, cancel: ctx.cancel.clone() };

        let task = WorkerTask {
            id,
            serial,
            status: ProcessStatus::Init,
            packet_type: PacketType::None,
            idle_ticks: 0,
            fragments: 0,
            messages: 0,
            parser: None,
            inbound: rx,
            state: state_tx,
            ctx,
            deregister: Some(deregister),
        };

        (handle, task)
    }

    /// Create a worker and spawn its task on the current runtime
    pub fn spawn(
        id: FlowId,
        serial: u64,
        ctx: WorkerContext,
        deregister: Deregister,
    ) -> (Self, JoinHandle<WorkerExit>) {
        let (handle, task) = Self::new(id, serial, ctx, deregister);
        let join = tokio::spawn(task.run());
        (handle, join)
    }

    pub fn id(&self) -> &FlowId {
        &self.id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Queue a fragment for this flow.
    ///
    /// Waits while the queue is full. Fails with `Cancelled` if the worker is
    /// shut down while waiting, and with `WorkerClosed` once it has terminated.
    pub async fn submit(&self, fragment: Fragment) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(ReassemblyError::cancelled(format!("submit to flow {}", self.id)))
            }
            sent = self.inbound.send(fragment) => {
                sent.map_err(|_| ReassemblyError::worker_closed(self.id.clone()))
            }
        }
    }

    /// Latest published state
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed() || self.state.borrow().terminated
    }

    /// Wait until the worker has flushed and deregistered
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| s.terminated).await;
    }

    /// Request a forced flush-and-exit. Repeated calls have no further effect.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// The task body owning one flow's state.
pub struct WorkerTask {
    id: FlowId,
    serial: u64,
    status: ProcessStatus,
    packet_type: PacketType,
    idle_ticks: u32,
    fragments: u64,
    messages: u64,
    parser: Option<Box<dyn Parser>>,
    inbound: mpsc::Receiver<Fragment>,
    state: watch::Sender<WorkerState>,
    ctx: WorkerContext,
    deregister: Option<Deregister>,
}

impl WorkerTask {
    /// Drive the flow until it is evicted, cancelled, detached or fails.
    pub async fn run(mut self) -> WorkerExit {
        let period = self.ctx.config.tick_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.ctx.cancel.clone();

        debug!(flow_id = %self.id, serial = self.serial, "Worker started");

        let reason = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break ExitReason::Cancelled,
                fragment = self.inbound.recv() => {
                    let Some(fragment) = fragment else {
                        break ExitReason::Detached;
                    };
                    if let Err(e) = self.handle_fragment(fragment) {
                        error!(flow_id = %self.id, "Closing flow after parse failure: {}", e);
                        break ExitReason::Failed(Arc::new(e));
                    }
                }
                _ = ticker.tick() => {
                    if self.on_tick() {
                        info!(
                            flow_id = %self.id,
                            "No data for {} ticks, closing flow",
                            self.ctx.config.max_idle_ticks
                        );
                        break ExitReason::Idle;
                    }
                }
            }
            self.publish(false);
        };

        drop(ticker);
        self.shutdown(reason)
    }

    /// Run `on_fragment`, turning a parser panic into a parse error for this flow.
    fn handle_fragment(&mut self, fragment: Fragment) -> Result<()> {
        panic::catch_unwind(AssertUnwindSafe(|| self.on_fragment(fragment))).unwrap_or_else(|payload| {
            // the parser was taken out of `self` and dropped during unwinding
            self.parser = None;
            Err(ReassemblyError::parse_error("parser", format!("panicked: {}", panic_message(&*payload))))
        })
    }

    fn on_fragment(&mut self, fragment: Fragment) -> Result<()> {
        self.idle_ticks = 0;
        self.fragments += 1;
        trace!(flow_id = %self.id, length = fragment.len(), "Fragment received");

        let mut parser = match self.parser.take() {
            Some(parser) => parser,
            None => {
                // detection only, the bytes are written below
                let parser = self.ctx.parsers.detect(fragment.data());
                debug!(flow_id = %self.id, parser = parser.name(), "Detected protocol");
                parser
            }
        };
        self.status = ProcessStatus::Processing;

        let written = parser.write(fragment.data());
        self.packet_type = parser.packet_type();
        let done = written.is_ok() && parser.is_done();
        self.parser = Some(parser);

        let consumed = written?;
        trace!(flow_id = %self.id, consumed, done, "Fragment parsed");

        if done {
            self.finish_message();
        }
        Ok(())
    }

    /// Returns true once the flow has been idle long enough to be evicted.
    fn on_tick(&mut self) -> bool {
        self.idle_ticks += 1;
        trace!(flow_id = %self.id, idle_ticks = self.idle_ticks, "Idle tick");
        self.idle_ticks >= self.ctx.config.max_idle_ticks
    }

    fn finish_message(&mut self) {
        self.status = ProcessStatus::Done;
        self.flush();
        self.parser = None;
        self.packet_type = PacketType::None;
        self.status = ProcessStatus::Init;
    }

    /// Emit whatever the parser holds, then clear it. No-op when empty.
    fn flush(&mut self) {
        let Some(parser) = self.parser.as_mut() else {
            return;
        };

        let shown = parser.display();
        if shown.is_empty() {
            return;
        }

        let body = if self.ctx.config.hex_dump { hexdump(&shown).into_bytes() } else { shown };
        let record = MessageRecord {
            flow_id: self.id.clone(),
            parser_name: parser.name(),
            parser_type: parser.parser_type(),
            packet_type: self.packet_type,
            body,
        };

        debug!(
            flow_id = %self.id,
            parser = record.parser_name,
            length = record.len(),
            "Flushing message"
        );

        if let Err(e) = self.ctx.sink.emit(&record) {
            warn!(flow_id = %self.id, "Failed to emit message: {}", e);
        }

        parser.reset();
        self.messages += 1;
    }

    fn shutdown(mut self, mut reason: ExitReason) -> WorkerExit {
        self.inbound.close();

        if matches!(reason, ExitReason::Failed(_)) {
            let mut dropped = 0usize;
            while self.inbound.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                warn!(flow_id = %self.id, dropped, "Discarded fragments queued behind a parse failure");
            }
        } else {
            // accepted before the queue closed, so still processed
            while let Ok(fragment) = self.inbound.try_recv() {
                if let Err(e) = self.handle_fragment(fragment) {
                    error!(flow_id = %self.id, "Parse failure while draining: {}", e);
                    reason = ExitReason::Failed(Arc::new(e));
                    break;
                }
            }
        }

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.flush())) {
            error!(flow_id = %self.id, "Parser panicked during final flush: {}", panic_message(&*payload));
        }
        self.parser = None;
        self.packet_type = PacketType::None;
        self.status = ProcessStatus::Init;
        self.idle_ticks = 0;

        info!(
            flow_id = %self.id,
            serial = self.serial,
            reason = %reason,
            fragments = self.fragments,
            messages = self.messages,
            "Worker closed"
        );

        let exit = WorkerExit {
            flow_id: self.id.clone(),
            serial: self.serial,
            reason,
            fragments: self.fragments,
            messages: self.messages,
        };

        if let Some(deregister) = self.deregister.take() {
            deregister(exit.clone());
        }
        self.publish(true);

        exit
    }

    fn publish(&self, terminated: bool) {
        self.state.send_replace(WorkerState {
            status: self.status,
            packet_type: self.packet_type,
            idle_ticks: self.idle_ticks,
            fragments: self.fragments,
            messages: self.messages,
            terminated,
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::BuiltinParsers;
    use crate::test_utils::{RecordingSink, ScriptedParsers};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn context(parsers: Arc<dyn ParserFactory>, sink: Arc<RecordingSink>, config: WorkerConfig) -> WorkerContext {
        WorkerContext { config: Arc::new(config), sink, parsers, cancel: CancellationToken::new() }
    }

    fn exit_channel() -> (Deregister, UnboundedReceiver<WorkerExit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let deregister: Deregister = Box::new(move |exit| {
            let _ = tx.send(exit);
        });
        (deregister, rx)
    }

    fn fragment(payload: &[u8]) -> Fragment {
        Fragment::new("F1", payload.to_vec())
    }

    async fn wait_for_messages(worker: &EventWorker, messages: u64) {
        let mut state = worker.watch_state();
        tokio::time::timeout(Duration::from_millis(500), state.wait_for(|s| s.messages >= messages))
            .await
            .expect("timed out waiting for flush")
            .expect("worker state channel closed");
    }

    #[tokio::test(start_paused = true)]
    async fn three_fragments_form_one_message() {
        let _ = tracing_subscriber::fmt::try_init();
        let sink = Arc::new(RecordingSink::default());
        let parsers = Arc::new(ScriptedParsers::new(3));
        let (deregister, _exits) = exit_channel();
        let ctx = context(parsers.clone(), sink.clone(), WorkerConfig::default());
        let (worker, _join) = EventWorker::spawn(FlowId::from("F1"), 0, ctx, deregister);

        for part in [&b"GET "[..], b"/ HTTP/1.1", b"\r\n\r\n"] {
            worker.submit(fragment(part)).await.unwrap();
        }
        wait_for_messages(&worker, 1).await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].flow_id.as_str(), "F1");
        assert_eq!(records[0].body, b"GET / HTTP/1.1\r\n\r\n");

        let state = worker.state();
        assert_eq!(state.status, ProcessStatus::Init);
        assert_eq!(state.packet_type, PacketType::None);
        assert!(!state.terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn parser_sees_fragments_in_submission_order() {
        let sink = Arc::new(RecordingSink::default());
        let parsers = Arc::new(ScriptedParsers::new(1000));
        let (deregister, _exits) = exit_channel();
        let ctx = context(parsers.clone(), sink.clone(), WorkerConfig::default());
        let (worker, _join) = EventWorker::spawn(FlowId::from("F1"), 0, ctx, deregister);

        let expected: Vec<Vec<u8>> = (0..64u32).map(|i| i.to_be_bytes().to_vec()).collect();
        for payload in &expected {
            worker.submit(fragment(payload)).await.unwrap();
        }

        let mut state = worker.watch_state();
        state.wait_for(|s| s.fragments == 64).await.unwrap();
        assert_eq!(parsers.writes(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_message_is_flushed_before_next_detection() {
        let sink = Arc::new(RecordingSink::default());
        let parsers = Arc::new(ScriptedParsers::new(2));
        let (deregister, _exits) = exit_channel();
        let ctx = context(parsers.clone(), sink.clone(), WorkerConfig::default());
        let (worker, _join) = EventWorker::spawn(FlowId::from("F1"), 0, ctx, deregister);

        for part in [b"a", b"b", b"c", b"d"] {
            worker.submit(fragment(part)).await.unwrap();
        }
        wait_for_messages(&worker, 2).await;

        let bodies: Vec<Vec<u8>> = sink.records().into_iter().map(|r| r.body).collect();
        assert_eq!(bodies, vec![b"ab".to_vec(), b"cd".to_vec()]);
        assert_eq!(parsers.detections(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_flow_flushes_partial_output_and_deregisters_once() {
        let sink = Arc::new(RecordingSink::default());
        let (deregister, mut exits) = exit_channel();
        let ctx = context(Arc::new(BuiltinParsers), sink.clone(), WorkerConfig::default());
        let (worker, join) = EventWorker::spawn(FlowId::from("F1"), 0, ctx, deregister);

        let start = Instant::now();
        worker.submit(fragment(b"GET /partial HTTP/1.1\r\nHost: exa")).await.unwrap();
        worker.closed().await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(1), "evicted too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1200), "evicted too late: {elapsed:?}");

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].parser_name, "HTTPRequest");
        assert_eq!(records[0].body, b"GET /partial HTTP/1.1\r\nHost: exa");

        let exit = join.await.unwrap();
        assert!(matches!(exit.reason, ExitReason::Idle));
        assert!(matches!(exits.recv().await, Some(WorkerExit { reason: ExitReason::Idle, .. })));
        assert!(exits.recv().await.is_none());

        let err = worker.submit(fragment(b"late")).await.unwrap_err();
        assert!(matches!(err, ReassemblyError::WorkerClosed { .. }));
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fragments_reset_idle_counter() {
        let sink = Arc::new(RecordingSink::default());
        let parsers = Arc::new(ScriptedParsers::new(1000));
        let (deregister, _exits) = exit_channel();
        let ctx = context(parsers, sink.clone(), WorkerConfig::default());
        let (worker, _join) = EventWorker::spawn(FlowId::from("F1"), 0, ctx, deregister);

        for _ in 0..5 {
            worker.submit(fragment(b"x")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert!(worker.state().idle_ticks < 10);
        }
        assert!(!worker.is_closed());
        assert!(sink.records().is_empty());

        tokio::time::sleep(Duration::from_millis(700)).await;
        worker.closed().await;
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.records()[0].body, b"xxxxx");
    }

    #[tokio::test(start_paused = true)]
    async fn parse_failure_closes_only_this_flow_with_partial_output() {
        let sink = Arc::new(RecordingSink::default());
        let (deregister, mut exits) = exit_channel();
        let ctx = context(Arc::new(ScriptedParsers::new(10)), sink.clone(), WorkerConfig::default());
        let (worker, _join) = EventWorker::spawn(FlowId::from("F1"), 0, ctx, deregister);

        worker.submit(fragment(b"ok-part")).await.unwrap();
        worker.submit(fragment(b"!bad")).await.unwrap();
        worker.closed().await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].body, b"ok-part");

        let exit = exits.recv().await.unwrap();
        match exit.reason {
            ExitReason::Failed(e) => assert!(matches!(*e, ReassemblyError::Parse { .. })),
            other => panic!("expected parse failure, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn parser_panic_fails_the_flow_and_still_deregisters() {
        let sink = Arc::new(RecordingSink::default());
        let (deregister, mut exits) = exit_channel();
        let ctx = context(Arc::new(ScriptedParsers::new(10)), sink.clone(), WorkerConfig::default());
        let (worker, join) = EventWorker::spawn(FlowId::from("F1"), 0, ctx, deregister);

        worker.submit(fragment(b"before")).await.unwrap();
        worker.submit(fragment(b"!panic")).await.unwrap();
        worker.closed().await;

        let exit = join.await.expect("worker task must not propagate the panic");
        match &exit.reason {
            ExitReason::Failed(e) => assert!(e.to_string().contains("scripted parser panic")),
            other => panic!("expected failure, got {other}"),
        }
        assert_eq!(exit.fragments, 2);
        assert!(matches!(exits.recv().await, Some(WorkerExit { reason: ExitReason::Failed(_), .. })));
        assert!(worker.state().terminated);
        assert!(sink.records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn parser_sees_payload_truncated_to_logical_length() {
        let sink = Arc::new(RecordingSink::default());
        let parsers = Arc::new(ScriptedParsers::new(1));
        let (deregister, _exits) = exit_channel();
        let ctx = context(parsers.clone(), sink.clone(), WorkerConfig::default());
        let (worker, _join) = EventWorker::spawn(FlowId::from("F1"), 0, ctx, deregister);

        let buffer = b"GET /a HTTP/1.1\r\n\r\n\0\0\0stale capture bytes".to_vec();
        worker.submit(Fragment::with_len("F1", buffer, 19)).await.unwrap();
        wait_for_messages(&worker, 1).await;

        assert_eq!(parsers.writes(), vec![b"GET /a HTTP/1.1\r\n\r\n".to_vec()]);
        assert_eq!(sink.records()[0].body, b"GET /a HTTP/1.1\r\n\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn forced_shutdown_is_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let (deregister, mut exits) = exit_channel();
        let ctx = context(Arc::new(ScriptedParsers::new(10)), sink.clone(), WorkerConfig::default());
        let (worker, _join) = EventWorker::spawn(FlowId::from("F1"), 0, ctx, deregister);

        worker.submit(fragment(b"partial")).await.unwrap();
        let start = Instant::now();
        worker.shutdown();
        worker.shutdown();
        worker.closed().await;
        worker.shutdown();

        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(sink.records().len(), 1);
        assert!(matches!(exits.recv().await, Some(WorkerExit { reason: ExitReason::Cancelled, .. })));
        assert!(exits.recv().await.is_none());

        let err = worker.submit(fragment(b"late")).await.unwrap_err();
        assert!(matches!(err, ReassemblyError::Cancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_handle_detaches_and_flushes() {
        let sink = Arc::new(RecordingSink::default());
        let (deregister, mut exits) = exit_channel();
        let ctx = context(Arc::new(ScriptedParsers::new(10)), sink.clone(), WorkerConfig::default());
        let (worker, join) = EventWorker::spawn(FlowId::from("F1"), 0, ctx, deregister);

        worker.submit(fragment(b"tail")).await.unwrap();
        drop(worker);

        let exit = join.await.unwrap();
        assert!(matches!(exit.reason, ExitReason::Detached));
        assert_eq!(exit.fragments, 1);
        assert_eq!(sink.records()[0].body, b"tail");
        assert!(exits.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn hex_dump_mode_renders_body() {
        let sink = Arc::new(RecordingSink::default());
        let (deregister, _exits) = exit_channel();
        let config = WorkerConfig::default().with_hex_dump(true);
        let ctx = context(Arc::new(ScriptedParsers::new(1)), sink.clone(), config);
        let (worker, _join) = EventWorker::spawn(FlowId::from("F1"), 0, ctx, deregister);

        worker.submit(fragment(b"GET / HTTP/1.1\r\n")).await.unwrap();
        wait_for_messages(&worker, 1).await;

        let record = &sink.records()[0];
        assert_eq!(record.body, hexdump(b"GET / HTTP/1.1\r\n").into_bytes());
        assert_eq!(record.len(), record.body.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_queue_blocks_submitter_without_dropping() {
        let sink = Arc::new(RecordingSink::default());
        let (parsers, gate) = ScriptedParsers::gated(1000);
        let parsers = Arc::new(parsers);
        let (deregister, _exits) = exit_channel();
        let ctx = context(parsers.clone(), sink.clone(), WorkerConfig::default());
        let (worker, _join) = EventWorker::spawn(FlowId::from("F1"), 0, ctx, deregister);

        // the first fragment is taken off the queue and parks inside the parser
        worker.submit(fragment(&[0])).await.unwrap();
        while !gate.entered() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for i in 1..=16u8 {
            worker.submit(fragment(&[i])).await.unwrap();
        }

        let blocked = tokio::time::timeout(Duration::from_millis(100), worker.submit(fragment(&[17]))).await;
        assert!(blocked.is_err(), "submit should wait while the queue is full");

        gate.release();
        tokio::time::timeout(Duration::from_secs(1), worker.submit(fragment(&[17])))
            .await
            .expect("submit should proceed once the worker drains")
            .unwrap();

        let mut state = worker.watch_state();
        tokio::time::timeout(Duration::from_secs(1), state.wait_for(|s| s.fragments == 18))
            .await
            .unwrap()
            .unwrap();
        let writes: Vec<u8> = parsers.writes().into_iter().map(|w| w[0]).collect();
        assert_eq!(writes, (0..=17u8).collect::<Vec<_>>());
    }
}
